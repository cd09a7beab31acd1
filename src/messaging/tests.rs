//! Messaging Module Tests
//!
//! ## Test Scopes
//! - **Dispatcher**: registration, topic routing, reply synthesis.
//! - **Local Hub**: fire-and-forget delivery, request/response, unreachable and slow peers.
//! - **HTTP Channel**: a request/response exchange between two real listeners.

#[cfg(test)]
mod tests {
    use crate::cluster::types::NodeId;
    use crate::compute::types::{JobId, SessionId};
    use crate::config::FabricConfig;
    use crate::error::FabricError;
    use crate::messaging::channel::MessageChannel;
    use crate::messaging::dispatcher::MessageDispatcher;
    use crate::messaging::envelope::{Envelope, Topic};
    use crate::messaging::http::{AddressBook, HttpChannel};
    use crate::messaging::local::LocalHub;

    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    fn invoke(method: &str) -> Envelope {
        Envelope::ServiceInvoke {
            name: "echo".to_string(),
            method: method.to_string(),
            args: serde_json::json!([1, 2]),
        }
    }

    // ============================================================
    // TEST 1: Envelope topics
    // ============================================================

    #[test]
    fn test_envelope_topics() {
        let cancel = Envelope::CancelJob {
            session_id: SessionId::new(),
            job_id: JobId::new(),
        };
        let sibling = Envelope::CancelSibling {
            session_id: SessionId::new(),
            job_id: JobId::new(),
        };

        assert_eq!(cancel.topic(), Topic::Job);
        assert_eq!(sibling.topic(), Topic::Task);
        assert_eq!(invoke("get").topic(), Topic::Service);
        assert_eq!(Envelope::Undeploy { name: "x".to_string() }.topic(), Topic::Deployment);
        assert_eq!(Envelope::Ack.topic(), Topic::Reply);
    }

    // ============================================================
    // TEST 2: Dispatcher
    // ============================================================

    #[tokio::test]
    async fn test_dispatcher_routes_by_topic() {
        // ARRANGE
        let dispatcher = MessageDispatcher::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        dispatcher.register(Topic::Service, move |_from, envelope| {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                match envelope {
                    Envelope::ServiceInvoke { method, .. } => Ok(Some(Envelope::ServiceInvokeResponse {
                        result: Ok(serde_json::json!(method)),
                    })),
                    _ => Ok(None),
                }
            }
        });

        // ACT
        let reply = dispatcher.dispatch(NodeId::from("a"), invoke("ping")).await.unwrap();

        // ASSERT
        assert!(dispatcher.has_handler(Topic::Service));
        assert_eq!(dispatcher.handler_count(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        match reply {
            Some(Envelope::ServiceInvokeResponse { result }) => assert_eq!(result.unwrap(), "ping"),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dispatcher_unknown_topic_is_error() {
        let dispatcher = MessageDispatcher::new();

        let result = dispatcher.dispatch(NodeId::from("a"), Envelope::Ack).await;

        assert!(result.unwrap_err().to_string().contains("No handler registered"));
    }

    #[tokio::test]
    async fn test_handle_request_synthesizes_replies() {
        let dispatcher = MessageDispatcher::new();
        dispatcher.register(Topic::Deployment, |_from, _envelope| async { Ok(None) });
        dispatcher.register(Topic::Service, |_from, _envelope| async {
            Err(anyhow::Error::new(FabricError::NoServiceInstance(
                "echo".to_string(),
            )))
        });

        let ack = dispatcher
            .handle_request(NodeId::from("a"), Envelope::Undeploy { name: "x".to_string() })
            .await;
        let failure = dispatcher.handle_request(NodeId::from("a"), invoke("get")).await;

        assert!(matches!(ack, Envelope::Ack));
        assert!(matches!(failure, Envelope::Failure(FabricError::NoServiceInstance(_))));
    }

    // ============================================================
    // TEST 3: Local hub
    // ============================================================

    #[tokio::test]
    async fn test_local_send_is_delivered() {
        // ARRANGE
        let hub = LocalHub::new();
        let a = hub.connect(NodeId::from("a"));
        let b = hub.connect(NodeId::from("b"));
        let delivered = Arc::new(Notify::new());

        let notify = delivered.clone();
        b.dispatcher().register(Topic::Service, move |from, _envelope| {
            let notify = notify.clone();
            async move {
                assert_eq!(from, NodeId::from("a"));
                notify.notify_one();
                Ok(None)
            }
        });

        // ACT
        a.send(&NodeId::from("b"), invoke("fire")).await.unwrap();

        // ASSERT
        tokio::time::timeout(Duration::from_secs(1), delivered.notified())
            .await
            .expect("message should be delivered");
    }

    #[tokio::test]
    async fn test_local_request_surfaces_failure_reply() {
        let hub = LocalHub::new();
        let a = hub.connect(NodeId::from("a"));
        let b = hub.connect(NodeId::from("b"));
        b.dispatcher().register(Topic::Service, |_from, _envelope| async {
            Err(anyhow::Error::new(FabricError::NoServiceInstance(
                "echo".to_string(),
            )))
        });

        let result = a
            .request(&NodeId::from("b"), invoke("get"), Duration::from_secs(1))
            .await;

        assert!(matches!(result, Err(FabricError::NoServiceInstance(name)) if name == "echo"));
    }

    #[tokio::test]
    async fn test_local_disconnected_node_is_unreachable() {
        let hub = LocalHub::new();
        let a = hub.connect(NodeId::from("a"));
        let _b = hub.connect(NodeId::from("b"));
        hub.disconnect(&NodeId::from("b"));

        let send = a.send(&NodeId::from("b"), Envelope::Ack).await;
        let request = a
            .request(&NodeId::from("b"), invoke("get"), Duration::from_secs(1))
            .await;

        assert!(!hub.is_connected(&NodeId::from("b")));
        assert!(matches!(send, Err(FabricError::NodeUnreachable(_))));
        assert!(matches!(request, Err(FabricError::NodeUnreachable(_))));
    }

    #[tokio::test]
    async fn test_local_request_times_out() {
        let hub = LocalHub::new();
        let a = hub.connect(NodeId::from("a"));
        let b = hub.connect(NodeId::from("b"));
        b.dispatcher().register(Topic::Service, |_from, _envelope| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(None)
        });

        let result = a
            .request(&NodeId::from("b"), invoke("slow"), Duration::from_millis(50))
            .await;

        assert!(matches!(result, Err(FabricError::Timeout(_))));
    }

    // ============================================================
    // TEST 4: HTTP channel
    // ============================================================

    struct StaticAddresses(HashMap<NodeId, SocketAddr>);

    impl AddressBook for StaticAddresses {
        fn http_addr(&self, node: &NodeId) -> Option<SocketAddr> {
            self.0.get(node).copied()
        }
    }

    #[tokio::test]
    async fn test_http_request_round_trip() {
        // ARRANGE: one listener for node "b"
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let b_addr = listener.local_addr().unwrap();
        let addresses: Arc<dyn AddressBook> =
            Arc::new(StaticAddresses(HashMap::from([(NodeId::from("b"), b_addr)])));

        let config = FabricConfig::default();
        let a = HttpChannel::new(NodeId::from("a"), addresses.clone(), &config);
        let b = HttpChannel::new(NodeId::from("b"), addresses, &config);

        b.dispatcher().register(Topic::Service, |from, envelope| async move {
            let Envelope::ServiceInvoke { method, .. } = envelope else {
                return Ok(None);
            };
            Ok(Some(Envelope::ServiceInvokeResponse {
                result: Ok(serde_json::json!(format!("{}:{}", from, method))),
            }))
        });
        let app = b.router();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        // ACT
        let reply = a
            .request(&NodeId::from("b"), invoke("hello"), Duration::from_secs(2))
            .await
            .expect("request should succeed");
        let unknown = a.send(&NodeId::from("zzz"), Envelope::Ack).await;

        // ASSERT
        match reply {
            Envelope::ServiceInvokeResponse { result } => assert_eq!(result.unwrap(), "a:hello"),
            other => panic!("unexpected reply: {other:?}"),
        }
        assert!(matches!(unknown, Err(FabricError::NodeUnreachable(_))));
    }
}
