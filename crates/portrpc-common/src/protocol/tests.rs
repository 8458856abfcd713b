//! Tests for the protocol module
//!
//! These tests cover service-method routing, version negotiation rules,
//! metadata ordering and the status code table.

#[cfg(test)]
mod tests {
    use super::super::*;

    // ========================================================================
    // ServiceMethod
    // ========================================================================

    #[test]
    fn test_split_valid() {
        let sm = ServiceMethod::new("Calculator.Add");
        assert_eq!(sm.split(), Some(("Calculator", "Add")));
    }

    #[test]
    fn test_split_rejects_malformed() {
        for bad in ["", ".", "Calculator", "Calculator.", ".Add", "a.b.c", "a..b"] {
            assert_eq!(ServiceMethod::new(bad).split(), None, "{bad:?} should not split");
        }
    }

    #[test]
    fn test_split_iff_exactly_one_dot() {
        let samples = ["x.y", "xy", "x.y.z", "long_name.Method", "a.", ".b", "..", "Ä.ö"];
        for s in samples {
            let dots = s.matches('.').count();
            let expected = dots == 1 && !s.starts_with('.') && !s.ends_with('.');
            assert_eq!(ServiceMethod::new(s).split().is_some(), expected, "{s}");
        }
    }

    #[test]
    fn test_service_method_display() {
        assert_eq!(ServiceMethod::from("A.B").to_string(), "A.B");
    }

    // ========================================================================
    // Version
    // ========================================================================

    #[test]
    fn test_version_same_major_compatible() {
        let a = Version::new(1, 0, 0);
        assert!(a.compatible_with(&Version::new(1, 7, 3)));
        assert!(a.compatible_with(&Version::new(1, 0, 65535)));
    }

    #[test]
    fn test_version_different_major_incompatible() {
        let a = Version::new(1, 2, 3);
        assert!(!a.compatible_with(&Version::new(2, 2, 3)));
        assert!(!a.compatible_with(&Version::new(0, 2, 3)));
    }

    #[test]
    fn test_version_display() {
        assert_eq!(Version::new(1, 2, 3).to_string(), "v1.2.3");
        assert_eq!(Version::default(), PROTOCOL_VERSION);
    }

    #[test]
    fn test_incompatible_version_error_message() {
        let err = RpcError::IncompatibleVersion {
            ours: Version::new(1, 0, 0),
            theirs: Version::new(2, 0, 0),
        };
        assert_eq!(
            err.to_string(),
            "my version is v1.0.0, got v2.0.0: version is not compatible"
        );
    }

    // ========================================================================
    // Metadata
    // ========================================================================

    #[test]
    fn test_metadata_insert_and_append() {
        let mut md = Metadata::new();
        md.insert("a", "1");
        md.append("a", "2");
        md.insert("b", "x");
        assert_eq!(md.get("a"), Some(&["1".to_string(), "2".to_string()][..]));
        assert_eq!(md.get_first("b"), Some("x"));

        md.insert("a", "3");
        assert_eq!(md.get("a"), Some(&["3".to_string()][..]));
        assert_eq!(md.len(), 2);
    }

    #[test]
    fn test_metadata_json_preserves_order() {
        let mut md = Metadata::new();
        md.insert("zeta", "1");
        md.insert("alpha", "2");
        md.append("mid", "3");
        md.append("mid", "4");

        let json = serde_json::to_string(&md).unwrap();
        assert_eq!(json, r#"{"zeta":["1"],"alpha":["2"],"mid":["3","4"]}"#);

        let back: Metadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back, md);
        let keys: Vec<_> = back.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_metadata_remove() {
        let mut md: Metadata = [("a", "1"), ("b", "2")].into_iter().collect();
        assert_eq!(md.remove("a"), Some(vec!["1".to_string()]));
        assert_eq!(md.remove("a"), None);
        assert_eq!(md.len(), 1);
    }

    // ========================================================================
    // StatusCode / Response
    // ========================================================================

    #[test]
    fn test_status_code_values() {
        assert_eq!(StatusCode::Ok.as_u16(), 0);
        assert_eq!(StatusCode::ErrorFromService.as_u16(), 1);
        assert_eq!(StatusCode::InvalidServiceMethod.as_u16(), 2);
        assert_eq!(StatusCode::ServiceNotFound.as_u16(), 3);
        assert_eq!(StatusCode::MethodNotFound.as_u16(), 4);
        assert_eq!(StatusCode::BadRequest.as_u16(), 5);
        assert_eq!(StatusCode::InternalError.as_u16(), 6);
        for v in 0..=6u16 {
            assert_eq!(StatusCode::from_u16(v).map(StatusCode::as_u16), Some(v));
        }
        assert_eq!(StatusCode::from_u16(7), None);
    }

    #[test]
    fn test_response_constructors() {
        let ok = Response::ok(Body::empty());
        assert!(ok.status.is_ok());
        assert!(ok.error.is_none());

        let err = Response::error(StatusCode::MethodNotFound, "code: StatusMethodNotFound");
        assert_eq!(err.status, StatusCode::MethodNotFound);
        assert_eq!(err.error_message(), "code: StatusMethodNotFound");
        assert!(err.body.is_empty());
    }

    #[tokio::test]
    async fn test_body_read_to_end() {
        let body = Body::from_bytes(b"hello".to_vec());
        assert_eq!(body.read_to_end().await.unwrap(), b"hello");

        let empty = Body::empty();
        assert!(empty.read_to_end().await.unwrap().is_empty());
    }

    // ========================================================================
    // Error conversions
    // ========================================================================

    fn build_http_request(uri: &str) -> Result<hyper::Request<()>> {
        Ok(hyper::Request::builder().uri(uri).body(())?)
    }

    #[test]
    fn test_http_builder_error_is_transport_error() {
        assert!(build_http_request("http://127.0.0.1/rpc").is_ok());
        let err = build_http_request("http://[not-a-host/rpc").unwrap_err();
        assert!(matches!(err, RpcError::Transport(_)));
    }
}
