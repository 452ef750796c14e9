//! Tests for references, endpoints and frames.

#[cfg(test)]
mod tests {
    use super::super::*;
    use serde_json::json;
    use std::collections::HashSet;
    use std::time::Duration;

    #[test]
    fn test_endpoint_uri_parsing() {
        let endpoint: Endpoint = "tcp://10.0.0.1:10000?timeout=250".parse().unwrap();
        assert_eq!(endpoint.transport, TransportKind::Tcp);
        assert_eq!(endpoint.host, "10.0.0.1");
        assert_eq!(endpoint.port, 10000);
        assert_eq!(endpoint.timeout(), Some(Duration::from_millis(250)));
        assert_eq!(endpoint.protocol, Protocol::Ice2);
        assert_eq!(endpoint.to_string(), "tcp://10.0.0.1:10000");
    }

    #[test]
    fn test_endpoint_classic_parsing() {
        let endpoint: Endpoint = "ssl -h db.example.com -p 4061 -t 1000".parse().unwrap();
        assert_eq!(endpoint.transport, TransportKind::Ssl);
        assert!(endpoint.is_secure());
        assert_eq!(endpoint.protocol, Protocol::Ice1);
        assert_eq!(endpoint.to_string(), "ssl -h db.example.com -p 4061 -t 1000");
    }

    #[test]
    fn test_endpoint_parse_errors() {
        assert!("tcp://host".parse::<Endpoint>().is_err());
        assert!("tcp -h host".parse::<Endpoint>().is_err());
        assert!("carrier-pigeon://host:1".parse::<Endpoint>().is_err());
        assert!("tcp://host:1?color=blue".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_endpoint_equality_ignores_timeout() {
        let a = Endpoint::tcp("h1", 1).with_timeout(100);
        let b = Endpoint::tcp("h1", 1).with_timeout(900);
        let c = Endpoint::tcp("h1", 1).with_source_address("10.1.1.1");
        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<Endpoint> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_reference_kinds() {
        let direct = Reference::direct("printer", vec![Endpoint::tcp("h1", 1)]);
        assert!(!direct.is_indirect());
        assert_eq!(direct.endpoints().len(), 1);

        let indirect = Reference::indirect("printer", "PrinterAdapter");
        assert!(indirect.is_indirect());
        assert!(!indirect.is_well_known());
        assert_eq!(indirect.location(), ["PrinterAdapter".to_string()]);

        let well_known = Reference::well_known("printer");
        assert!(well_known.is_indirect());
        assert!(well_known.is_well_known());
        assert!(well_known.endpoints().is_empty());
    }

    #[test]
    fn test_reference_structural_sharing() {
        let base = Reference::indirect("printer", "A").with_retry_max_attempts(3);
        assert!(Reference::ptr_eq(&base, &base.with_retry_max_attempts(3)));
        assert!(Reference::ptr_eq(&base, &base.with_mode(InvocationMode::Twoway)));

        let oneway = base.with_mode(InvocationMode::Oneway);
        assert!(!Reference::ptr_eq(&base, &oneway));
        assert_eq!(base.mode(), InvocationMode::Twoway);
        assert_eq!(oneway.mode(), InvocationMode::Oneway);
        assert_eq!(oneway.retry_max_attempts(), Some(3));
    }

    #[test]
    fn test_reference_empty_location_is_well_known() {
        let reference = Reference::indirect("printer", "A").with_location(Vec::new());
        assert!(reference.is_well_known());
    }

    #[test]
    fn test_reference_display() {
        let reference = Reference::indirect(Identity::new("p").with_category("c"), "A")
            .with_facet("admin");
        assert_eq!(reference.to_string(), "c/p -f admin @ A");
    }

    #[test]
    fn test_request_id_uniqueness() {
        let ids: HashSet<_> = (0..1000)
            .map(|_| RequestFrame::new("obj", "op", json!(null)).id)
            .collect();
        assert_eq!(ids.len(), 1000, "All request IDs should be unique");
    }

    #[test]
    fn test_request_payload_size() {
        let request = RequestFrame::new("obj", "op", json!({"n": 1}));
        assert_eq!(request.payload_size().unwrap(), r#"{"n":1}"#.len());
    }

    #[test]
    fn test_response_with_retry_hint() {
        let response = ResponseFrame::failure(7, ReplyStatus::ObjectNotExist, json!(null))
            .with_retry_policy(RetryPolicy::OtherReplica);
        assert!(!response.is_success());
        assert!(response.status.is_not_exist());

        let json = serde_json::to_string(&response).unwrap();
        let decoded: ResponseFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.retry_policy, Some(RetryPolicy::OtherReplica));
    }

    #[test]
    fn test_retry_policy_delay() {
        assert_eq!(RetryPolicy::Immediately.delay(), None);
        assert_eq!(RetryPolicy::AfterDelay(Duration::ZERO).delay(), None);
        assert_eq!(
            RetryPolicy::AfterDelay(Duration::from_millis(5)).delay(),
            Some(Duration::from_millis(5))
        );
        assert!(!RetryPolicy::NoRetry.is_retryable());
    }

    #[test]
    fn test_error_root_unwraps_wrappers() {
        use std::sync::Arc;
        let shared = LodestarError::Shared(Arc::new(LodestarError::ConnectFailed("h:1".into())));
        assert!(shared.is_connect_failure());
        let locator = LodestarError::Locator(Arc::new(LodestarError::Cancelled));
        assert!(locator.is_cancelled());
    }
}
