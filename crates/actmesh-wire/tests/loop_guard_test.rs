//! Own-message and message-loop detection across real hops.

mod common;

use actmesh_types::{CheckConfig, Failure, TransportConfig, TransportKind, WarnConfig};
use common::{init_tracing, settings, Node};
use serde_json::{json, Value};
use std::sync::Arc;

/// A node whose only client points back at its own listener.
async fn self_looped(kind: TransportKind, config: TransportConfig) -> Arc<Node> {
    let node = Node::new("a", config);
    node.add("c:1", |_, _| Ok(json!({"handled": "a"})));
    let port = node.listen(kind).await;
    node.client(kind, port, &[]).await;
    node
}

async fn own_message_rejected(kind: TransportKind) {
    init_tracing();
    let a = self_looped(kind, settings()).await;

    let err = a.remote("c:1", Value::Null).await.unwrap_err();
    assert!(
        matches!(err.failure, Failure::OwnMessage { .. }),
        "expected an own-message rejection, got {err}"
    );
    assert!(!err.is_timeout());
    assert!(err.to_string().contains(a.instance().as_str()));
    assert_eq!(a.calls("c:1"), 0);
    assert_eq!(a.inbound(), 0);

    a.close().await;
}

#[tokio::test]
async fn test_tcp_own_message_rejected() {
    own_message_rejected(TransportKind::Tcp).await;
}

#[tokio::test]
async fn test_http_own_message_rejected() {
    own_message_rejected(TransportKind::Http).await;
}

async fn own_message_warn_only(kind: TransportKind) {
    init_tracing();
    let config = TransportConfig {
        warn: WarnConfig {
            own_message: true,
            message_loop: true,
        },
        ..settings()
    };
    let a = self_looped(kind, config).await;

    let out = a.remote("c:1", Value::Null).await.unwrap();
    assert_eq!(out, json!({"handled": "a"}));
    // Processed exactly once despite the warning.
    assert_eq!(a.calls("c:1"), 1);
    assert_eq!(a.inbound(), 1);

    a.close().await;
}

#[tokio::test]
async fn test_tcp_own_message_warn_only() {
    own_message_warn_only(TransportKind::Tcp).await;
}

#[tokio::test]
async fn test_http_own_message_warn_only() {
    own_message_warn_only(TransportKind::Http).await;
}

#[tokio::test]
async fn test_own_message_check_disabled() {
    init_tracing();
    let config = TransportConfig {
        check: CheckConfig {
            own_message: false,
            message_loop: false,
        },
        ..settings()
    };
    let a = self_looped(TransportKind::Tcp, config).await;

    assert!(a.remote("c:1", Value::Null).await.is_ok());
    assert_eq!(a.calls("c:1"), 1);

    a.close().await;
}

/// Two nodes pointing at each other. `a` only warns about its own messages
/// and skips the loop check, so an unhandled call bounces a -> b -> a -> b
/// until `b` sees itself on the path.
async fn own_message_between_two_nodes(kind: TransportKind) {
    init_tracing();
    let a = Node::new(
        "a",
        TransportConfig {
            check: CheckConfig {
                own_message: true,
                message_loop: false,
            },
            warn: WarnConfig {
                own_message: true,
                message_loop: false,
            },
            ..settings()
        },
    );
    let b = Node::new("b", settings());
    a.add("a:1", |_, input| Ok(json!({"aa": input.get("a")})));
    b.add("b:1", |_, input| Ok(json!({"bb": input.get("b")})));

    let port_a = a.listen(kind).await;
    let port_b = b.listen(kind).await;
    a.client(kind, port_b, &[]).await;
    b.client(kind, port_a, &[]).await;

    let out = a.act("a:1", json!({"a": 1})).await.unwrap();
    assert_eq!(out, json!({"aa": 1}));
    let out = b.act("b:1", json!({"b": 1})).await.unwrap();
    assert_eq!(out, json!({"bb": 1}));

    let err = a.act("c:1", Value::Null).await.unwrap_err();
    assert!(
        matches!(err.failure, Failure::MessageLoop { .. }),
        "expected the loop to be stopped at b, got {err}"
    );

    // a admitted its own message once with a warning; b rejected the
    // second arrival.
    assert_eq!(a.inbound(), 1);
    assert_eq!(b.inbound(), 1);
    assert_eq!(a.forwarded(), 1);
    assert_eq!(b.forwarded(), 1);

    a.close().await;
    b.close().await;
    assert_eq!(a.calls("a:1"), 1);
    assert_eq!(b.calls("b:1"), 1);
}

#[tokio::test]
async fn test_tcp_own_message_between_two_nodes() {
    own_message_between_two_nodes(TransportKind::Tcp).await;
}

#[tokio::test]
async fn test_http_own_message_between_two_nodes() {
    own_message_between_two_nodes(TransportKind::Http).await;
}

/// Three nodes wired in a ring: a -> b -> c -> a. Only `a` checks for
/// message loops without the own-message check, so the loop check is the
/// one that fires when the call returns to `a`.
async fn ring(kind: TransportKind, a_warn_loop: bool) -> [Arc<Node>; 3] {
    let a = Node::new(
        "a",
        TransportConfig {
            check: CheckConfig {
                own_message: false,
                message_loop: true,
            },
            warn: WarnConfig {
                own_message: false,
                message_loop: a_warn_loop,
            },
            ..settings()
        },
    );
    let b = Node::new("b", settings());
    let c = Node::new("c", settings());

    let port_a = a.listen(kind).await;
    let port_b = b.listen(kind).await;
    let port_c = c.listen(kind).await;

    a.client(kind, port_b, &[]).await;
    b.client(kind, port_c, &[]).await;
    c.client(kind, port_a, &[]).await;

    [a, b, c]
}

async fn message_loop_rejected(kind: TransportKind) {
    init_tracing();
    let [a, b, c] = ring(kind, false).await;

    let err = a.remote("x:1", Value::Null).await.unwrap_err();
    assert!(
        matches!(err.failure, Failure::MessageLoop { .. }),
        "expected a message-loop rejection, got {err}"
    );
    assert!(!err.is_timeout());

    // b and c each handled their first touch once; a never admitted the
    // looped request.
    assert_eq!(b.inbound(), 1);
    assert_eq!(c.inbound(), 1);
    assert_eq!(b.forwarded(), 1);
    assert_eq!(c.forwarded(), 1);
    assert_eq!(a.inbound(), 0);

    for node in [&a, &b, &c] {
        node.close().await;
    }
}

#[tokio::test]
async fn test_tcp_message_loop_rejected() {
    message_loop_rejected(TransportKind::Tcp).await;
}

#[tokio::test]
async fn test_http_message_loop_rejected() {
    message_loop_rejected(TransportKind::Http).await;
}

#[tokio::test]
async fn test_message_loop_warn_only() {
    init_tracing();
    let [a, b, c] = ring(TransportKind::Tcp, true).await;
    a.add("x:1", |_, _| Ok(json!({"handled": "a"})));

    let out = a.remote("x:1", Value::Null).await.unwrap();
    assert_eq!(out, json!({"handled": "a"}));
    assert_eq!(a.calls("x:1"), 1);
    assert_eq!(a.inbound(), 1);
    assert_eq!(b.forwarded(), 1);
    assert_eq!(c.forwarded(), 1);

    for node in [&a, &b, &c] {
        node.close().await;
    }
}

#[tokio::test]
async fn test_unrelated_chain_is_not_a_loop() {
    init_tracing();
    // a -> b -> c, where c handles the call.
    let a = Node::new("a", settings());
    let b = Node::new("b", settings());
    let c = Node::new("c", settings());
    c.add("x:1", |_, _| Ok(json!({"handled": "c"})));

    let port_b = b.listen(TransportKind::Http).await;
    let port_c = c.listen(TransportKind::Tcp).await;
    a.client(TransportKind::Http, port_b, &[]).await;
    b.client(TransportKind::Tcp, port_c, &[]).await;

    let out = a.act("x:1", Value::Null).await.unwrap();
    assert_eq!(out, json!({"handled": "c"}));
    assert_eq!(b.forwarded(), 1);
    assert_eq!(c.calls("x:1"), 1);

    for node in [&a, &b, &c] {
        node.close().await;
    }
}
