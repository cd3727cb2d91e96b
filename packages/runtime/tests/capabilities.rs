// ABOUTME: Integration tests checking native and sandboxed adapters behave the same for one workspace
// ABOUTME: The in-process engine runs sandbox commands on the host against temporary directories

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use pretty_assertions::assert_eq;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use warden_config::constants::*;
use warden_config::{AdapterMode, WardenConfig};
use warden_runtime::{
    BufferSink, Capabilities, CapabilityFactory, ChannelSink, Encoding, ExecutionError, ExecutionRequest,
    FileNode, FileOperationError, ModeResolver, PageRequest, SessionError,
};
use warden_sandbox::{
    CreateOptions, LocalProcessEngine, SandboxManager, SandboxRegistry, SandboxStorage,
    SqliteSettingsRepository, WaitPolicy,
};

const NATIVE: &str = "tenant-native";
const SANDBOXED: &str = "tenant-sandboxed";

struct Harness {
    factory: CapabilityFactory,
    container: TempDir,
    native_sessions: TempDir,
    sandbox_sessions: TempDir,
    _native_root: TempDir,
}

async fn harness_with(engine: LocalProcessEngine, overrides: &[(&str, &str)]) -> Harness {
    let native_root = TempDir::new().unwrap();
    let container = TempDir::new().unwrap();
    let native_sessions = TempDir::new().unwrap();
    let sandbox_sessions = TempDir::new().unwrap();

    let mut vars: HashMap<String, String> = HashMap::new();
    vars.insert(
        WARDEN_NATIVE_WORKSPACE_ROOT.to_string(),
        native_root.path().display().to_string(),
    );
    vars.insert(
        WARDEN_CONTAINER_WORKSPACE.to_string(),
        container.path().display().to_string(),
    );
    vars.insert(
        WARDEN_NATIVE_SESSIONS_ROOT.to_string(),
        native_sessions.path().display().to_string(),
    );
    vars.insert(
        WARDEN_SANDBOX_SESSIONS_ROOT.to_string(),
        sandbox_sessions.path().display().to_string(),
    );
    for (key, value) in overrides {
        vars.insert(key.to_string(), value.to_string());
    }
    let config = WardenConfig::from_lookup(|key| vars.get(key).cloned()).unwrap();

    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    SandboxStorage::migrate(&pool).await.unwrap();

    let registry = Arc::new(SandboxRegistry::new(Arc::new(SandboxStorage::new(
        pool.clone(),
    ))));
    let manager = SandboxManager::new(Arc::new(engine), registry, config.sandbox.clone());
    let modes = Arc::new(ModeResolver::new(
        Arc::new(SqliteSettingsRepository::new(pool)),
        AdapterMode::Native,
    ));
    modes.set(SANDBOXED, AdapterMode::Sandboxed).await.unwrap();

    Harness {
        factory: CapabilityFactory::new(manager, modes, config),
        container,
        native_sessions,
        sandbox_sessions,
        _native_root: native_root,
    }
}

async fn harness() -> Harness {
    harness_with(LocalProcessEngine::new(), &[]).await
}

impl Harness {
    /// Capabilities for both tenants with the sandbox already running
    async fn both(&self) -> [Capabilities; 2] {
        self.factory
            .manager()
            .get_or_create(
                SANDBOXED,
                CreateOptions::default(),
                WaitPolicy::wait(Duration::from_secs(5)),
            )
            .await
            .unwrap();
        let native = self.factory.for_tenant(NATIVE).await.unwrap();
        let sandboxed = self.factory.for_tenant(SANDBOXED).await.unwrap();
        assert_eq!(native.mode, AdapterMode::Native);
        assert_eq!(sandboxed.mode, AdapterMode::Sandboxed);
        [native, sandboxed]
    }
}

fn strip_permissions(mut node: FileNode) -> FileNode {
    node.permissions.clear();
    node.children = node
        .children
        .map(|children| children.into_iter().map(strip_permissions).collect());
    node
}

fn child_names(node: &FileNode) -> Vec<&str> {
    node.children
        .iter()
        .flatten()
        .map(|c| c.name.as_str())
        .collect()
}

fn message(role: &str, text: &str) -> String {
    serde_json::json!({
        "type": role,
        "message": { "role": role, "content": text }
    })
    .to_string()
}

fn write_session(root: &Path, project: &str, id: &str, lines: &[String], mtime: u64) {
    let dir = root.join(project);
    std::fs::create_dir_all(&dir).unwrap();
    let path: PathBuf = dir.join(format!("{}.jsonl", id));
    std::fs::write(&path, lines.join("\n")).unwrap();
    let file = std::fs::File::options().write(true).open(&path).unwrap();
    file.set_modified(std::time::UNIX_EPOCH + Duration::from_secs(mtime))
        .unwrap();
}

#[tokio::test]
async fn test_file_contents_round_trip_in_both_modes() {
    let h = harness().await;
    // Large enough to need several chunks on the sandboxed write path
    let binary: Vec<u8> = (0..150_000u32).map(|i| (i * 7 % 256) as u8).collect();

    for caps in h.both().await {
        let written = caps
            .files
            .write("docs/notes.md", "hello\nworld\n", Encoding::Utf8)
            .await
            .unwrap();
        assert_eq!(written, 12);
        let text = caps.files.read("docs/notes.md").await.unwrap();
        assert_eq!(text.content, "hello\nworld\n");
        assert_eq!(text.encoding, Encoding::Utf8);

        caps.files
            .write("bin/blob.dat", &BASE64.encode(&binary), Encoding::Base64)
            .await
            .unwrap();
        let blob = caps.files.read("/bin/blob.dat").await.unwrap();
        assert_eq!(blob.encoding, Encoding::Base64, "{:?}", caps.mode);
        assert_eq!(blob.size, binary.len() as u64);
        assert_eq!(blob.into_bytes().unwrap(), binary);

        assert!(caps.files.exists("bin").await.unwrap());
        assert!(!caps.files.exists("bin/other.dat").await.unwrap());
    }

    // The sandboxed tenant's files land in the container workspace
    assert!(h.container.path().join("docs/notes.md").is_file());
}

#[tokio::test]
async fn test_errors_match_across_modes() {
    let h = harness_with(LocalProcessEngine::new(), &[(WARDEN_MAX_READ_BYTES, "1024")]).await;
    let mut outcomes = Vec::new();

    for caps in h.both().await {
        let files = &caps.files;
        files
            .write("docs/notes.md", "hello", Encoding::Utf8)
            .await
            .unwrap();
        files
            .write("big.txt", &"x".repeat(2000), Encoding::Utf8)
            .await
            .unwrap();

        outcomes.push(vec![
            files.read("missing.txt").await.map(|_| ()),
            files.read("../outside").await.map(|_| ()),
            files.read("docs").await.map(|_| ()),
            files.read("big.txt").await.map(|_| ()),
            files.stat("nope").await.map(|_| ()),
            files.delete("docs", false).await,
            files.delete("/", true).await,
            files.mkdir("docs/notes.md").await,
            files.tree("docs/notes.md", 2).await.map(|_| ()),
            files
                .write("docs/notes.md/inner/x.txt", "x", Encoding::Utf8)
                .await
                .map(|_| ()),
            files.mkdir("docs/notes.md/inner").await,
        ]);
    }

    let sandboxed = outcomes.pop().unwrap();
    let native = outcomes.pop().unwrap();
    assert_eq!(native, sandboxed);
    assert_eq!(native[0], Err(FileOperationError::NotFound("/missing.txt".into())));
    assert!(matches!(native[1], Err(FileOperationError::PathTraversal(_))));
    assert_eq!(native[2], Err(FileOperationError::IsADirectory("/docs".into())));
    assert_eq!(
        native[3],
        Err(FileOperationError::TooLarge {
            path: "/big.txt".into(),
            size: 2000,
            limit: 1024,
        })
    );
    assert!(matches!(&native[5], Err(FileOperationError::Failed(msg)) if msg.contains("not empty")));
    assert_eq!(
        native[7],
        Err(FileOperationError::NotADirectory("/docs/notes.md".into()))
    );
    assert_eq!(
        native[9],
        Err(FileOperationError::NotADirectory("/docs/notes.md/inner/x.txt".into()))
    );
    assert_eq!(
        native[10],
        Err(FileOperationError::NotADirectory("/docs/notes.md/inner".into()))
    );
}

#[tokio::test]
async fn test_read_only_parent_is_permission_denied_in_both_modes() {
    use std::os::unix::fs::PermissionsExt;

    // Root ignores directory permissions
    if nix::unistd::Uid::effective().is_root() {
        return;
    }
    let h = harness().await;
    let mut outcomes = Vec::new();

    for (caps, host) in h
        .both()
        .await
        .into_iter()
        .zip([h.factory.native_workspace(NATIVE), h.container.path().to_path_buf()])
    {
        caps.files.mkdir("locked").await.unwrap();
        let locked = host.join("locked");
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o555)).unwrap();

        outcomes.push(vec![
            caps.files
                .write("locked/sub/new.txt", "x", Encoding::Utf8)
                .await
                .map(|_| ()),
            caps.files.mkdir("locked/sub").await,
        ]);
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    let sandboxed = outcomes.pop().unwrap();
    let native = outcomes.pop().unwrap();
    assert_eq!(native, sandboxed);
    assert_eq!(
        native,
        vec![
            Err(FileOperationError::PermissionDenied("/locked/sub/new.txt".into())),
            Err(FileOperationError::PermissionDenied("/locked/sub".into())),
        ]
    );
}

#[tokio::test]
async fn test_tree_and_stat_match_across_modes() {
    let h = harness().await;
    let mut trees = Vec::new();
    let mut stats = Vec::new();

    for caps in h.both().await {
        let files = &caps.files;
        for (path, content) in [
            ("src/main.rs", "fn main() {}\n"),
            ("src/lib/mod.rs", "pub mod a;\n"),
            ("my project/read me.md", "# hi\n"),
            ("node_modules/pkg/index.js", "module.exports = 1;\n"),
            (".git/HEAD", "ref: refs/heads/main\n"),
            ("Cargo.toml", "[package]\n"),
        ] {
            files.write(path, content, Encoding::Utf8).await.unwrap();
        }
        files.mkdir("empty").await.unwrap();

        trees.push(strip_permissions(files.tree("/", 3).await.unwrap()));
        let stat = files.stat("src/main.rs").await.unwrap();
        stats.push((stat.path, stat.kind, stat.size, stat.mode));
    }

    assert_eq!(trees[0], trees[1]);
    assert_eq!(stats[0], stats[1]);

    let tree = &trees[0];
    assert_eq!(tree.path, "/");
    assert_eq!(
        child_names(tree),
        vec![".git", "empty", "my project", "node_modules", "src", "Cargo.toml"]
    );
    let children = tree.children.as_ref().unwrap();
    let modules = children.iter().find(|c| c.name == "node_modules").unwrap();
    assert_eq!(modules.children, None);
    let spaced = children.iter().find(|c| c.name == "my project").unwrap();
    assert_eq!(child_names(spaced), vec!["read me.md"]);
    assert_eq!(spaced.children.as_ref().unwrap()[0].path, "/my project/read me.md");
    assert_eq!(spaced.children.as_ref().unwrap()[0].size, 5);
}

#[tokio::test]
async fn test_execution_results_match_across_modes() {
    let h = harness().await;
    for caps in h.both().await {
        caps.files.mkdir("app").await.unwrap();
        let sink = Arc::new(BufferSink::new());
        let result = caps
            .execution
            .execute(
                ExecutionRequest::new(
                    "run-1",
                    "echo \"$GREETING from $(basename \"$(pwd)\")\"; echo failed >&2; exit 3",
                    sink.clone(),
                )
                .with_cwd("app")
                .with_env("GREETING", "hello"),
            )
            .await
            .unwrap();

        assert!(!result.success, "{:?}", caps.mode);
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(sink.stdout(), "hello from app\n");
        assert_eq!(sink.stderr(), "failed\n");
        assert!(!caps.execution.is_active("run-1"));

        assert_eq!(
            caps.execution
                .execute(ExecutionRequest::new("run-2", "true", sink).with_cwd("missing"))
                .await,
            Err(ExecutionError::InvalidCwd("/missing".into()))
        );
    }
}

#[tokio::test]
async fn test_sandboxed_abort_kills_the_remote_command() {
    let h = harness().await;
    let [_, caps] = h.both().await;
    let session = uuid::Uuid::new_v4().to_string();
    let marker = h.container.path().join("finished");

    let execution = caps.execution.clone();
    let request = ExecutionRequest::new(
        session.clone(),
        "sleep 2 && touch finished",
        Arc::new(BufferSink::new()),
    );
    let run = tokio::spawn(async move { execution.execute(request).await });

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(caps.execution.is_active(&session));
    assert_eq!(caps.execution.list_active().len(), 1);
    assert!(caps.execution.abort(&session).await.unwrap());

    let result = run.await.unwrap();
    assert_eq!(result, Err(ExecutionError::Aborted(session.clone())));
    assert!(!caps.execution.is_active(&session));
    assert!(!caps.execution.abort(&session).await.unwrap());

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(!marker.exists());
}

#[tokio::test]
async fn test_sandboxed_timeout() {
    let h = harness().await;
    let [_, caps] = h.both().await;
    let started = std::time::Instant::now();
    let result = caps
        .execution
        .execute(
            ExecutionRequest::new(
                uuid::Uuid::new_v4().to_string(),
                "sleep 5",
                Arc::new(BufferSink::new()),
            )
            .with_timeout(Duration::from_millis(300)),
        )
        .await;

    assert_eq!(
        result,
        Err(ExecutionError::Timeout {
            after: Duration::from_millis(300)
        })
    );
    assert!(started.elapsed() < Duration::from_secs(4));
}

const CHATTY: &str = "seq 1 100000; sleep 2; touch finished";

#[tokio::test]
async fn test_unread_stream_does_not_hold_off_timeout_in_either_mode() {
    let h = harness().await;
    for caps in h.both().await {
        let (sink, _rx) = ChannelSink::new(1);
        let started = std::time::Instant::now();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            caps.execution.execute(
                ExecutionRequest::new(uuid::Uuid::new_v4().to_string(), CHATTY, Arc::new(sink))
                    .with_timeout(Duration::from_millis(300)),
            ),
        )
        .await
        .expect("execute should return at its deadline");

        assert_eq!(
            result,
            Err(ExecutionError::Timeout {
                after: Duration::from_millis(300)
            }),
            "{:?} mode",
            caps.mode
        );
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(caps.execution.list_active().is_empty());
    }
}

#[tokio::test]
async fn test_unread_stream_does_not_hold_off_abort_in_either_mode() {
    let h = harness().await;
    let markers = [
        h.factory.native_workspace(NATIVE).join("finished"),
        h.container.path().join("finished"),
    ];

    for caps in h.both().await {
        let (sink, _rx) = ChannelSink::new(1);
        let session = uuid::Uuid::new_v4().to_string();
        let execution = caps.execution.clone();
        let request = ExecutionRequest::new(session.clone(), CHATTY, Arc::new(sink));
        let run = tokio::spawn(async move { execution.execute(request).await });

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(caps.execution.abort(&session).await.unwrap());

        let result = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("abort should end the run")
            .unwrap();
        assert_eq!(result, Err(ExecutionError::Aborted(session.clone())));
        assert!(!caps.execution.is_active(&session));
    }

    tokio::time::sleep(Duration::from_millis(2500)).await;
    for marker in markers {
        assert!(!marker.exists(), "{} should not exist", marker.display());
    }
}

#[tokio::test]
async fn test_adapters_report_not_ready_while_sandbox_starts() {
    let h = harness_with(
        LocalProcessEngine::new().with_create_delay(Duration::from_secs(2)),
        &[],
    )
    .await;

    let caps = h.factory.for_tenant(SANDBOXED).await.unwrap();
    assert_eq!(
        caps.files.read("notes.md").await,
        Err(FileOperationError::NotReady)
    );
    let sessions = caps
        .sessions
        .list_sessions(None, PageRequest::default())
        .await
        .unwrap();
    assert!(sessions.pending);
    assert!(sessions.items.is_empty());
    let searched = caps
        .sessions
        .search("anything", PageRequest::default())
        .await
        .unwrap();
    assert!(searched.pending);
    assert_eq!(
        caps.execution
            .execute(ExecutionRequest::new("s1", "true", Arc::new(BufferSink::new())))
            .await,
        Err(ExecutionError::NotReady)
    );

    // Joins the creation already in flight
    h.factory
        .manager()
        .get_or_create(
            SANDBOXED,
            CreateOptions::default(),
            WaitPolicy::wait(Duration::from_secs(5)),
        )
        .await
        .unwrap();
    assert!(!caps.files.exists("notes.md").await.unwrap());
}

#[tokio::test]
async fn test_execution_on_stopped_sandbox_is_not_running() {
    let h = harness().await;
    let [_, caps] = h.both().await;
    h.factory.manager().stop(SANDBOXED).await.unwrap();

    assert_eq!(
        caps.execution
            .execute(ExecutionRequest::new("s1", "true", Arc::new(BufferSink::new())))
            .await,
        Err(ExecutionError::NotRunning("stopped".into()))
    );
}

#[tokio::test]
async fn test_sessions_match_across_modes() {
    let h = harness().await;
    for root in [h.native_sessions.path(), h.sandbox_sessions.path()] {
        write_session(
            root,
            "-home-me-app",
            "s-old",
            &[
                message("user", "Deploy the API to staging"),
                message("assistant", "Deploying the api now"),
            ],
            1_000,
        );
        write_session(
            root,
            "-home-me-app",
            "s-new",
            &[message("user", "Fix the flaky test")],
            3_000,
        );
        write_session(
            root,
            "-home-me-lib",
            "s-lib",
            &[message("user", "Bump the api client")],
            2_000,
        );
    }

    let [native, sandboxed] = h.both().await;
    let mut results = Vec::new();
    for caps in [&native, &sandboxed] {
        let sessions = &caps.sessions;
        let listed = sessions
            .list_sessions(None, PageRequest::new(0, 2))
            .await
            .unwrap();
        let app = sessions
            .list_sessions(Some("-home-me-app"), PageRequest::default())
            .await
            .unwrap();
        let hits = sessions.search("API", PageRequest::default()).await.unwrap();
        let messages = sessions
            .get_messages("s-old", PageRequest::new(1, 10))
            .await
            .unwrap();
        sessions.delete("s-lib").await.unwrap();
        let deleted = sessions.get_messages("s-lib", PageRequest::default()).await;
        results.push((listed, app, hits, messages, deleted));
    }

    let sandboxed_results = results.pop().unwrap();
    let native_results = results.pop().unwrap();
    assert_eq!(native_results, sandboxed_results);

    let (listed, app, hits, messages, deleted) = native_results;
    let ids: Vec<_> = listed.items.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec!["s-new", "s-lib"]);
    assert_eq!(listed.items[0].title.as_deref(), Some("Fix the flaky test"));
    assert!(listed.has_more);
    assert!(!listed.pending);
    assert_eq!(app.total, 2);
    assert_eq!(hits.total, 3);
    assert_eq!(messages.items[0].role, "assistant");
    assert_eq!(deleted, Err(SessionError::NotFound("s-lib".into())));
}
