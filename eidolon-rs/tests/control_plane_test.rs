//! End-to-end tests of routing, invites and quota enforcement

use eidolon_rs::daemon::mock::MockDaemon;
use eidolon_rs::models::{Role, RouteType, User};
use eidolon_rs::routing::RouteService;
use eidolon_rs::service::InviteService;
use eidolon_rs::store::{SqliteStore, Store, TrafficRepository, UserRepository};
use eidolon_rs::traffic::{ActiveConnections, TrafficEnforcer};
use std::sync::Arc;
use std::time::Duration;

struct ControlPlane {
    store: Arc<dyn Store>,
    daemon: Arc<MockDaemon>,
    routes: RouteService,
    invites: InviteService,
    admin: User,
}

async fn setup() -> ControlPlane {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().await.unwrap());
    let daemon = Arc::new(MockDaemon::new());
    let admin = store.create_user(&User::new("root", Role::Admin)).await.unwrap();

    ControlPlane {
        routes: RouteService::new(store.clone(), daemon.clone()),
        invites: InviteService::new(store.clone()),
        store,
        daemon,
        admin,
    }
}

#[tokio::test]
async fn test_invited_user_resolves_assigned_route() {
    let cp = setup().await;

    let invite = cp.invites.generate(cp.admin.id).await.unwrap();
    let alice = cp
        .invites
        .use_invite(&invite.code, User::new("alice", Role::Unknown))
        .await
        .unwrap();
    assert_eq!(alice.role, Role::User);

    let route = cp
        .routes
        .create_route("10.0.0.0/24", None, "lab", Some(cp.admin.id))
        .await
        .unwrap();
    cp.routes.assign_route(&alice, alice.id, route.id).await.unwrap();

    let resolved = cp.routes.resolve(alice.id).await.unwrap();
    let networks: Vec<_> = resolved.iter().map(|r| r.network.as_str()).collect();
    assert_eq!(networks, vec!["10.0.0.0/24"]);
    assert!(cp.daemon.routes().await.contains(&"10.0.0.0/24".to_string()));
}

#[tokio::test]
async fn test_vassal_falls_back_to_default_routes() {
    let cp = setup().await;

    cp.routes
        .create_route("192.168.0.0/16", Some(RouteType::Default), "", None)
        .await
        .unwrap();
    let custom = cp
        .routes
        .create_route("172.16.0.0/12", None, "", None)
        .await
        .unwrap();

    // admin -> user -> vassal
    let invite = cp.invites.generate(cp.admin.id).await.unwrap();
    let user = cp
        .invites
        .use_invite(&invite.code, User::new("bob", Role::Unknown))
        .await
        .unwrap();
    let invite = cp.invites.generate(user.id).await.unwrap();
    let vassal = cp
        .invites
        .use_invite(&invite.code, User::new("carl", Role::Unknown))
        .await
        .unwrap();
    assert_eq!(vassal.role, Role::Vassal);
    assert_eq!(vassal.invited_by, Some(user.id));

    let resolved = cp.routes.resolve(vassal.id).await.unwrap();
    let networks: Vec<_> = resolved.iter().map(|r| r.network.as_str()).collect();
    assert_eq!(networks, vec!["192.168.0.0/16"]);

    // An individual assignment replaces the fallback
    cp.routes.assign_route(&cp.admin, vassal.id, custom.id).await.unwrap();
    let resolved = cp.routes.resolve(vassal.id).await.unwrap();
    let networks: Vec<_> = resolved.iter().map(|r| r.network.as_str()).collect();
    assert_eq!(networks, vec!["172.16.0.0/12"]);

    let tree = cp.invites.tree(cp.admin.id).await.unwrap();
    assert_eq!(tree[&cp.admin.id].len(), 1);
    assert_eq!(tree[&user.id][0].username, "carl");
}

#[tokio::test]
async fn test_vassal_cannot_invite_or_add_routes() {
    let cp = setup().await;

    let mut vassal = User::new("dora", Role::Vassal);
    vassal.invited_by = Some(cp.admin.id);
    let vassal = cp.store.create_user(&vassal).await.unwrap();

    assert!(cp.invites.generate(vassal.id).await.is_err());
    assert!(cp
        .routes
        .create_and_assign_route(&vassal, "10.9.0.0/16", "")
        .await
        .is_err());
}

#[tokio::test]
async fn test_enforcer_disconnects_over_quota() {
    let cp = setup().await;

    let mut heavy = User::new("heavy", Role::User);
    heavy.traffic_limit = 1_000;
    let heavy = cp.store.create_user(&heavy).await.unwrap();
    let light = cp.store.create_user(&User::new("light", Role::User)).await.unwrap();

    cp.daemon.connect("heavy", 900, 200).await;
    cp.daemon.connect("light", 5_000_000, 5_000_000).await;
    cp.daemon.connect("ghost", 1, 1).await;

    let connections = Arc::new(ActiveConnections::new());
    let enforcer = TrafficEnforcer::new(
        cp.store.clone(),
        cp.daemon.clone(),
        connections.clone(),
        Duration::from_secs(3600),
    );

    let report = enforcer.tick().await;
    assert_eq!(report.sessions, 3);
    assert_eq!(report.samples, 2);
    assert_eq!(report.disconnected, vec!["heavy".to_string()]);
    assert_eq!(cp.daemon.disconnected().await, vec!["heavy".to_string()]);

    assert_eq!(connections.get(heavy.id).await, Some("heavy".to_string()));
    assert_eq!(connections.get(light.id).await, Some("light".to_string()));
    assert_eq!(connections.len().await, 2);

    assert_eq!(cp.store.total_user_traffic(heavy.id).await.unwrap(), 1_100);
    assert_eq!(cp.store.total_user_traffic(light.id).await.unwrap(), 10_000_000);
}

#[tokio::test]
async fn test_enforcer_survives_listing_failure() {
    let cp = setup().await;
    cp.daemon.fail_session_listing(true).await;

    let connections = Arc::new(ActiveConnections::new());
    connections.insert(7, "stale".to_string()).await;
    let enforcer = TrafficEnforcer::new(
        cp.store.clone(),
        cp.daemon.clone(),
        connections.clone(),
        Duration::from_secs(3600),
    );

    let report = enforcer.tick().await;
    assert_eq!(report.sessions, 0);
    assert!(report.disconnected.is_empty());
    // The previous snapshot is kept when the daemon cannot be queried
    assert_eq!(connections.get(7).await, Some("stale".to_string()));
}
