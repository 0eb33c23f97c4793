use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::task::JoinHandle;
use worker_supervisor::bus::{Call, Connection, Controller, Invocation, Proxy, Reply};
use worker_supervisor::{AppError, Result};

/// Echoes its arguments. `make_child` returns a new object and
/// `shared_child` one bound under a fixed name; `call_back` invokes the
/// `callback` reference it is given.
struct Echo;

impl Controller for Echo {
    fn handle(&self, call: Call) -> Invocation<'_> {
        Box::pin(async move {
            match call.method.as_str() {
                "echo" => Ok(Reply::Value(call.args.clone())),
                "fail" => Err(AppError::InvalidArgument("bad input".into())),
                "make_child" => Ok(Reply::Object(Arc::new(Echo))),
                "shared_child" => Ok(Reply::Named("child".into(), Arc::new(Echo))),
                "call_back" => {
                    let callback = call.reference("callback")?;
                    let value = callback.invoke("echo", json!({ "from": "peer" })).await?;
                    Ok(Reply::Value(value))
                }
                _ => Err(call.unknown_method("echo")),
            }
        })
    }
}

fn pair() -> (Connection, Connection, Vec<JoinHandle<Result<()>>>) {
    let (left, right) = tokio::io::duplex(64 * 1024);
    let (a, a_driver) = Connection::new(left);
    let (b, b_driver) = Connection::new(right);
    let drivers = vec![tokio::spawn(a_driver.run()), tokio::spawn(b_driver.run())];
    (a, b, drivers)
}

async fn within<T>(future: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("bus call completed")
}

#[tokio::test]
async fn invokes_bound_object() {
    let (a, b, _drivers) = pair();
    a.bind("echo", Arc::new(Echo));

    let value = within(b.invoke("echo", "echo", json!({ "x": 1 }))).await.unwrap();
    assert_eq!(value, json!({ "x": 1 }));
}

#[tokio::test]
async fn errors_keep_their_kind() {
    let (a, b, _drivers) = pair();
    a.bind("echo", Arc::new(Echo));

    let err = within(b.invoke("echo", "fail", Value::Null)).await.unwrap_err();
    assert_eq!(err, AppError::InvalidArgument("bad input".into()));

    let err = within(b.invoke("echo", "nope", Value::Null)).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(ref msg) if msg.contains("nope")));

    let err = within(b.invoke("missing", "echo", Value::Null)).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(ref msg) if msg.contains("missing")));
}

#[tokio::test]
async fn object_results_become_proxies() {
    let (a, b, _drivers) = pair();
    a.bind("echo", Arc::new(Echo));

    let child = within(b.proxy("echo").call_object("make_child", Value::Null))
        .await
        .unwrap();
    assert_ne!(child.name(), "echo");

    let value = within(child.invoke("echo", json!("hi"))).await.unwrap();
    assert_eq!(value, json!("hi"));
}

#[tokio::test]
async fn references_call_back_into_the_sender() {
    let (a, b, _drivers) = pair();
    a.bind("echo", Arc::new(Echo));
    let callback = b.bind("callback", Arc::new(Echo));

    let value = within(
        b.proxy("echo")
            .invoke("call_back", json!({ "callback": callback.to_value() })),
    )
    .await
    .unwrap();
    assert_eq!(value, json!({ "from": "peer" }));
}

#[tokio::test]
async fn proxies_forward_across_connections() {
    // a <-> b and c <-> d; d re-exports the object bound on a.
    let (a, b, _ab) = pair();
    let (c, d, _cd) = pair();
    a.bind("echo", Arc::new(Echo));
    d.bind("relay", Arc::new(Proxy::new(b.clone(), "echo")));

    let direct = within(b.invoke("echo", "echo", json!([1, 2]))).await.unwrap();
    let relayed = within(c.invoke("relay", "echo", json!([1, 2]))).await.unwrap();
    assert_eq!(direct, relayed);

    let err = within(c.invoke("relay", "fail", Value::Null)).await.unwrap_err();
    assert_eq!(err, AppError::InvalidArgument("bad input".into()));
}

#[tokio::test]
async fn closing_fails_pending_and_future_calls() {
    let (a, b, drivers) = pair();
    a.close();
    for driver in drivers {
        within(driver).await.unwrap().unwrap();
    }

    assert!(a.is_closed());
    within(b.closed()).await;
    let err = within(b.invoke("echo", "echo", Value::Null)).await.unwrap_err();
    assert!(matches!(err, AppError::Ipc(_)));
}

#[tokio::test]
async fn repeated_forwarding_reuses_bindings() {
    let (a, b, _ab) = pair();
    let (c, d, _cd) = pair();
    a.bind("echo", Arc::new(Echo));
    d.bind("relay", Arc::new(Proxy::new(b.clone(), "echo")));
    let callback = c.bind("callback", Arc::new(Echo));

    let mut names = Vec::new();
    for _ in 0..100 {
        let child = within(c.proxy("relay").call_object("shared_child", Value::Null))
            .await
            .unwrap();
        names.push(child.name().to_owned());

        within(
            c.proxy("relay")
                .invoke("call_back", json!({ "callback": callback.to_value() })),
        )
        .await
        .unwrap();
    }

    names.dedup();
    assert_eq!(names.len(), 1);
    assert_eq!(a.binding_count(), 2, "echo and child");
    assert_eq!(b.binding_count(), 1, "forwarded callback");
    assert_eq!(d.binding_count(), 2, "relay and forwarded child");

    let value = within(c.invoke(&names[0], "echo", json!("again"))).await.unwrap();
    assert_eq!(value, json!("again"));
}

#[tokio::test]
async fn bindings_to_closed_connections_are_released() {
    let (a, b, _ab) = pair();
    let (_c, d, _cd) = pair();
    a.bind("echo", Arc::new(Echo));
    d.bind("relay", Arc::new(Proxy::new(b.clone(), "echo")));

    a.close();
    within(b.closed()).await;

    d.bind("local", Arc::new(Echo));
    assert_eq!(d.binding_count(), 1);
    assert!(!d.unbind("relay"));
    assert!(d.unbind("local"));
}
