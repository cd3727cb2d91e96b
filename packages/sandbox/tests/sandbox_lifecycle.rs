// ABOUTME: Integration tests for tenant sandbox lifecycle through the manager and reaper
// ABOUTME: Uses the in-process engine so concurrency and teardown run without a Docker daemon

use chrono::Utc;
use pretty_assertions::assert_eq;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use warden_config::{ReaperConfig, ResourceTier, SandboxConfig};
use warden_sandbox::{
    sandbox_name, ContainerEngine, ContainerState, CreateOptions, ExecSpec, IdleReaper,
    LocalProcessEngine, SandboxError, SandboxManager, SandboxRegistry, SandboxStatus,
    SandboxStorage, WaitPolicy,
};

fn sandbox_config() -> SandboxConfig {
    SandboxConfig {
        image: "ubuntu:22.04".to_string(),
        tier: ResourceTier::Standard,
        container_workspace: "/tmp".to_string(),
        create_timeout: Duration::from_secs(30),
        health_ttl: Duration::from_secs(60),
        stop_grace: Duration::from_secs(1),
    }
}

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");
    SandboxStorage::migrate(&pool)
        .await
        .expect("Failed to run migrations");
    pool
}

fn manager_over(pool: sqlx::SqlitePool, engine: Arc<LocalProcessEngine>) -> SandboxManager {
    let registry = Arc::new(SandboxRegistry::new(Arc::new(SandboxStorage::new(pool))));
    SandboxManager::new(engine, registry, sandbox_config())
}

async fn setup_manager(engine: Arc<LocalProcessEngine>) -> SandboxManager {
    manager_over(setup_pool().await, engine)
}

/// Three concurrent requests while creation takes 2s, each willing to wait 5s
#[tokio::test]
async fn test_concurrent_get_or_create_creates_once() {
    let engine = Arc::new(LocalProcessEngine::new().with_create_delay(Duration::from_secs(2)));
    let manager = setup_manager(engine.clone()).await;

    let mut handles = Vec::new();
    for _ in 0..3 {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            manager
                .get_or_create(
                    "tenant-a",
                    CreateOptions::default(),
                    WaitPolicy::wait(Duration::from_secs(5)),
                )
                .await
        }));
    }

    let mut ids = HashSet::new();
    for handle in handles {
        let descriptor = handle.await.unwrap().unwrap();
        assert_eq!(descriptor.status, SandboxStatus::Running);
        ids.insert(descriptor.id);
    }

    assert_eq!(ids.len(), 1);
    assert_eq!(engine.create_count(), 1);
    assert_eq!(engine.container_count(), 1);
}

#[tokio::test]
async fn test_many_tenants_proceed_in_parallel() {
    let engine = Arc::new(LocalProcessEngine::new().with_create_delay(Duration::from_millis(200)));
    let manager = setup_manager(engine.clone()).await;

    let mut handles = Vec::new();
    for tenant in 0..4 {
        for _ in 0..4 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                let tenant_id = format!("tenant-{}", tenant);
                let descriptor = manager
                    .get_or_create(
                        &tenant_id,
                        CreateOptions::default(),
                        WaitPolicy::wait(Duration::from_secs(5)),
                    )
                    .await
                    .unwrap();
                (tenant_id, descriptor.id)
            }));
        }
    }

    let mut by_tenant: std::collections::HashMap<String, HashSet<String>> = Default::default();
    for handle in handles {
        let (tenant, id) = handle.await.unwrap();
        by_tenant.entry(tenant).or_default().insert(id);
    }

    assert_eq!(by_tenant.len(), 4);
    assert!(by_tenant.values().all(|ids| ids.len() == 1));
    assert_eq!(engine.create_count(), 4);
}

#[tokio::test]
async fn test_destroy_then_recreate_gets_new_engine_id_same_name() {
    let engine = Arc::new(LocalProcessEngine::new());
    let manager = setup_manager(engine.clone()).await;
    let wait = WaitPolicy::wait(Duration::from_secs(5));

    let first = manager
        .get_or_create("tenant-a", CreateOptions::default(), wait)
        .await
        .unwrap();
    manager.destroy("tenant-a", false).await.unwrap();

    assert_eq!(engine.container_count(), 0);
    assert!(manager
        .registry()
        .storage()
        .get_by_tenant("tenant-a")
        .await
        .unwrap()
        .is_none());

    let second = manager
        .get_or_create("tenant-a", CreateOptions::default(), wait)
        .await
        .unwrap();
    assert_eq!(second.name, first.name);
    assert_eq!(second.name, sandbox_name("tenant-a"));
    assert_ne!(second.engine_id, first.engine_id);
    assert_ne!(second.id, first.id);
}

#[tokio::test]
async fn test_exec_on_stopped_sandbox_fails_without_side_effects() {
    let engine = Arc::new(LocalProcessEngine::new());
    let manager = setup_manager(engine.clone()).await;
    let descriptor = manager
        .get_or_create(
            "tenant-a",
            CreateOptions::default(),
            WaitPolicy::wait(Duration::from_secs(5)),
        )
        .await
        .unwrap();
    manager.stop("tenant-a").await.unwrap();
    let before = manager.registry().get("tenant-a").await.unwrap().unwrap();

    let err = manager
        .exec("tenant-a", ExecSpec::shell("echo hi"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SandboxError::NotRunning {
            status: SandboxStatus::Stopped,
            ..
        }
    ));

    let after = manager.registry().get("tenant-a").await.unwrap().unwrap();
    assert_eq!(after, before);
    assert_eq!(
        engine.container_state(&descriptor.name),
        Some(ContainerState::Exited)
    );
    assert!(engine.exec_log().is_empty());
}

#[tokio::test]
async fn test_exec_returns_before_command_completes() {
    let engine = Arc::new(LocalProcessEngine::new());
    let manager = setup_manager(engine.clone()).await;
    manager
        .get_or_create(
            "tenant-a",
            CreateOptions::default(),
            WaitPolicy::wait(Duration::from_secs(5)),
        )
        .await
        .unwrap();

    let handle = manager
        .exec("tenant-a", ExecSpec::shell("sleep 1; echo done"))
        .await
        .unwrap();
    let state = engine.inspect_exec(&handle.exec_id).await.unwrap();
    assert!(state.running);
    drop(handle);
}

#[tokio::test]
async fn test_restart_reuses_existing_container() {
    let engine = Arc::new(LocalProcessEngine::new());
    let pool = setup_pool().await;
    let wait = WaitPolicy::wait(Duration::from_secs(5));

    let first = manager_over(pool.clone(), engine.clone())
        .get_or_create("tenant-a", CreateOptions::default(), wait)
        .await
        .unwrap();

    // Fresh registry and manager over the same database, as after a process restart
    let restarted = manager_over(pool, engine.clone());
    let second = restarted
        .get_or_create("tenant-a", CreateOptions::default(), wait)
        .await
        .unwrap();

    assert_eq!(second.id, first.id);
    assert_eq!(second.engine_id, first.engine_id);
    assert_eq!(engine.create_count(), 1);
}

#[tokio::test]
async fn test_reaper_destroys_past_t2_and_leaves_recent_alone() {
    let engine = Arc::new(LocalProcessEngine::new());
    let manager = setup_manager(engine.clone()).await;
    let wait = WaitPolicy::wait(Duration::from_secs(5));

    for tenant in ["old", "recent"] {
        manager
            .get_or_create(tenant, CreateOptions::default(), wait)
            .await
            .unwrap();
    }
    let long_ago = Utc::now() - chrono::Duration::days(3);
    let mut old = manager.registry().get("old").await.unwrap().unwrap();
    old.last_activity_at = long_ago;
    manager.registry().put(&old, false).await.unwrap();

    let reaper = IdleReaper::new(
        manager.clone(),
        &ReaperConfig {
            idle_stop_after: Duration::from_secs(30 * 60),
            idle_destroy_after: Duration::from_secs(24 * 60 * 60),
            interval: Duration::from_secs(60),
            retain_volume: true,
        },
    );
    let report = reaper.sweep(Utc::now()).await.unwrap();

    assert_eq!(report.destroyed, vec!["old".to_string()]);
    assert!(report.stopped.is_empty());
    assert!(manager.registry().get("old").await.unwrap().is_none());

    let recent = manager.registry().get("recent").await.unwrap().unwrap();
    assert_eq!(recent.status, SandboxStatus::Running);
    assert_eq!(engine.container_count(), 1);
    // Retained for a future sandbox
    assert_eq!(engine.volumes().len(), 2);
}

#[tokio::test]
async fn test_reaper_skips_tenant_mid_creation() {
    let engine = Arc::new(LocalProcessEngine::new().with_create_delay(Duration::from_millis(500)));
    let manager = setup_manager(engine.clone()).await;

    let err = manager
        .get_or_create("slow", CreateOptions::default(), WaitPolicy::no_wait())
        .await
        .unwrap_err();
    assert!(err.is_not_ready());

    // Give the creation task time to persist its row
    tokio::time::sleep(Duration::from_millis(100)).await;

    let reaper = IdleReaper::new(
        manager.clone(),
        &ReaperConfig {
            idle_stop_after: Duration::from_secs(60),
            idle_destroy_after: Duration::from_secs(120),
            interval: Duration::from_secs(60),
            retain_volume: false,
        },
    );
    let report = reaper
        .sweep(Utc::now() + chrono::Duration::days(1))
        .await
        .unwrap();
    assert_eq!(report.skipped, vec!["slow".to_string()]);

    let ready = manager
        .get_or_create(
            "slow",
            CreateOptions::default(),
            WaitPolicy::wait(Duration::from_secs(5)),
        )
        .await
        .unwrap();
    assert_eq!(ready.status, SandboxStatus::Running);
}
