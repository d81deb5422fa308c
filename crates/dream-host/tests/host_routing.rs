//! Mounting, routing, lifecycle, and the administrative surface

use dream_core::{Endpoint, EndpointRegistry, Message, Method, Plug, StatusCode};
use dream_host::{Host, ServiceConfig, ServiceDescriptor, ServiceState};
use parking_lot::Mutex;
use std::sync::Arc;

fn rig(host: &Arc<Host>) -> Arc<EndpointRegistry> {
    let registry = Arc::new(EndpointRegistry::new());
    registry.add_endpoint(Arc::clone(host) as Arc<dyn Endpoint>);
    registry
}

fn users_service() -> ServiceDescriptor {
    ServiceDescriptor::new("users")
        .with_sid("sid://dream/users")
        .with_feature(Method::GET, "users", |_| async {
            Ok(Message::from_document(serde_json::json!({"users": []})))
        })
        .unwrap()
        .with_feature(Method::GET, "users/{id}", |ctx| async move {
            Ok(Message::from_document(serde_json::json!({"id": ctx.params["id"]})))
        })
        .unwrap()
        .with_feature(Method::POST, "users", |ctx| async move {
            let doc = ctx.request.document().cloned().unwrap_or_default();
            Ok(Message::from_document(serde_json::json!({"created": doc})))
        })
        .unwrap()
}

#[tokio::test]
async fn features_route_with_captures() {
    let host = Arc::new(Host::new("t1"));
    let registry = rig(&host);
    let token = host
        .mount_with_descriptor(ServiceConfig::new("users", "sid://dream/users", "api"), users_service())
        .await
        .unwrap();
    assert_eq!(host.service_state(token), Some(ServiceState::Running));

    let base = Plug::parse("local://t1/api").unwrap().with_registry(Arc::clone(&registry));

    let list = base.at(&["users"]).get().await.unwrap();
    assert!(list.is_success());

    let one = base.at(&["users", "42"]).get().await.unwrap();
    assert_eq!(one.document().unwrap()["id"], "42");

    let created =
        base.at(&["users"]).post_document(serde_json::json!({"name": "ada"})).await.unwrap();
    assert_eq!(created.document().unwrap()["created"]["name"], "ada");

    let missing = base.at(&["nope"]).get().await.unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn longest_mount_prefix_wins() {
    let host = Arc::new(Host::new("t2"));
    let registry = rig(&host);

    let outer = ServiceDescriptor::new("outer")
        .with_feature(Method::GET, "*", |_| async { Ok(Message::from_text("outer")) })
        .unwrap();
    let inner = ServiceDescriptor::new("inner")
        .with_feature(Method::GET, "*", |_| async { Ok(Message::from_text("inner")) })
        .unwrap();

    host.mount_with_descriptor(ServiceConfig::new("outer", "sid://o", "api"), outer)
        .await
        .unwrap();
    host.mount_with_descriptor(ServiceConfig::new("inner", "sid://i", "api/inner"), inner)
        .await
        .unwrap();

    let plug = Plug::parse("local://t2/api").unwrap().with_registry(Arc::clone(&registry));
    assert_eq!(plug.at(&["x"]).get().await.unwrap().to_text().unwrap(), "outer");
    assert_eq!(plug.at(&["inner", "x"]).get().await.unwrap().to_text().unwrap(), "inner");
}

#[tokio::test]
async fn failed_startup_leaves_failed_state() {
    let host = Arc::new(Host::new("t3"));
    let service = ServiceDescriptor::new("broken")
        .on_start(|_| async { Err(dream_core::Error::service("no database")) });

    let result = host
        .mount_with_descriptor(ServiceConfig::new("broken", "sid://b", "broken"), service)
        .await;
    assert!(result.is_err());

    // the mount stays, answering 503 rather than 404
    let registry = rig(&host);
    let response = Plug::parse("local://t3/broken")
        .unwrap()
        .with_registry(registry)
        .get()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn shutdown_stops_in_reverse_mount_order() {
    let host = Arc::new(Host::new("t4"));
    let stops: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    for (name, path) in [("first", "a"), ("second", "b")] {
        let stops = Arc::clone(&stops);
        let service = ServiceDescriptor::new(name).on_stop(move |ctx| {
            let stops = Arc::clone(&stops);
            async move {
                stops
                    .lock()
                    .push(if ctx.config.path == "a" { "first" } else { "second" });
                Ok(())
            }
        });
        host.mount_with_descriptor(ServiceConfig::new(name, "sid://s", path), service)
            .await
            .unwrap();
    }

    host.shutdown().await;
    assert_eq!(*stops.lock(), ["second", "first"]);
    assert_eq!(host.service_count(), 0);
}

#[tokio::test]
async fn admin_surface_requires_the_api_key() {
    let host = Arc::new(Host::new("t5"));
    host.register_service_class(
        "users",
        Box::new(|_config| Ok(users_service())),
    );
    let registry = rig(&host);

    let config = serde_json::json!({
        "class": "users",
        "sid": "sid://dream/users",
        "path": "api",
    });

    // no key: forbidden
    let denied = Plug::parse("local://t5/services")
        .unwrap()
        .with_registry(Arc::clone(&registry))
        .post_document(config.clone())
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::FORBIDDEN);

    // wrong key: forbidden
    let denied = Plug::parse("local://t5/services")
        .unwrap()
        .with_registry(Arc::clone(&registry))
        .with("apikey", "not-the-key")
        .post_document(config.clone())
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::FORBIDDEN);

    // correct key via header: service mounts and serves
    let mounted = Plug::parse("local://t5/services")
        .unwrap()
        .with_registry(Arc::clone(&registry))
        .with_header("X-ApiKey", host.api_key())
        .post_document(config)
        .await
        .unwrap();
    assert!(mounted.is_success());
    assert_eq!(host.service_count(), 1);

    let listed = Plug::parse("local://t5/api/users")
        .unwrap()
        .with_registry(Arc::clone(&registry))
        .get()
        .await
        .unwrap();
    assert!(listed.is_success());

    // unmount through the admin surface
    let unmounted = Plug::parse("local://t5/services/api")
        .unwrap()
        .with_registry(Arc::clone(&registry))
        .with("apikey", host.api_key())
        .delete()
        .await
        .unwrap();
    assert!(unmounted.is_success());
    assert_eq!(host.service_count(), 0);

    let gone = Plug::parse("local://t5/api/users")
        .unwrap()
        .with_registry(Arc::clone(&registry))
        .get()
        .await
        .unwrap();
    assert_eq!(gone.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn admin_unmount_distinguishes_missing_from_stop_failure() {
    let host = Arc::new(Host::new("t9"));
    let registry = rig(&host);

    let stubborn = ServiceDescriptor::new("stubborn")
        .on_stop(|_| async { Err(dream_core::Error::service("still writing")) });
    host.mount_with_descriptor(ServiceConfig::new("stubborn", "sid://s", "stubborn"), stubborn)
        .await
        .unwrap();

    // a mount that never existed is a plain 404
    let missing = Plug::parse("local://t9/services/no-such-service")
        .unwrap()
        .with_registry(Arc::clone(&registry))
        .with("apikey", host.api_key())
        .delete()
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    // the service existed but failed to stop cleanly: a server-side failure
    let failed = Plug::parse("local://t9/services/stubborn")
        .unwrap()
        .with_registry(Arc::clone(&registry))
        .with("apikey", host.api_key())
        .delete()
        .await
        .unwrap();
    assert_eq!(failed.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn load_surface_answers_not_implemented() {
    let host = Arc::new(Host::new("t6"));
    let registry = rig(&host);

    let response = Plug::parse("local://t6/load")
        .unwrap()
        .with_registry(registry)
        .with("apikey", host.api_key())
        .post_document(serde_json::json!({"name": "extensions"}))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
}

#[tokio::test]
async fn duplicate_mount_path_is_rejected() {
    let host = Arc::new(Host::new("t7"));
    host.mount_with_descriptor(
        ServiceConfig::new("users", "sid://u", "api"),
        users_service(),
    )
    .await
    .unwrap();

    let err = host
        .mount_with_descriptor(ServiceConfig::new("users", "sid://u", "api"), users_service())
        .await
        .unwrap_err();
    assert!(matches!(err, dream_core::Error::DuplicateRegistration { .. }));
}

#[tokio::test]
async fn mock_plane_outbids_a_hosted_service() {
    use dream_mock::MockPlane;

    let host = Arc::new(Host::new("t8"));
    let registry = rig(&host);
    host.mount_with_descriptor(ServiceConfig::new("users", "sid://u", "api"), users_service())
        .await
        .unwrap();

    let plane = Arc::new(MockPlane::new());
    registry.add_endpoint(Arc::clone(&plane) as Arc<dyn Endpoint>);
    let base = dream_core::Uri::parse("local://t8/api").unwrap();
    plane.setup(&base).at(&["users"]).returns(Message::from_text("mocked")).unwrap();

    let plug = Plug::parse("local://t8/api/users").unwrap().with_registry(Arc::clone(&registry));
    assert_eq!(plug.get().await.unwrap().to_text().unwrap(), "mocked");

    // dropping the mock restores the real service
    plane.deregister_all();
    assert!(plug.get().await.unwrap().is_success());
    assert!(plug.get().await.unwrap().document().is_some());
}
