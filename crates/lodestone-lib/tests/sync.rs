mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{eventually, init_logging};
use lodestone_lib::client::{ClientError, LatestSubscription};
use lodestone_lib::config::LauncherConfig;
use lodestone_lib::states::{descriptor_table, LaunchState, SettingMutation, SettingState, UserState};
use lodestone_lib::transport::connect_lines;
use lodestone_lib::Launcher;
use serde_json::json;
use tempfile::TempDir;

async fn launcher() -> (TempDir, Launcher) {
    init_logging();
    let dir = TempDir::new().unwrap();
    let launcher = Launcher::with_defaults(dir.path(), LauncherConfig::default())
        .await
        .unwrap();
    (dir, launcher)
}

#[tokio::test]
async fn mirror_follows_backend_and_frontend_mutations() {
    let (_dir, launcher) = launcher().await;
    let client = launcher.connect();

    let proxy = client
        .call_state("SettingService", "getSettings", vec![])
        .await
        .unwrap();
    assert_eq!(proxy.type_name(), "SettingState");
    assert_eq!(proxy.get::<SettingState>().unwrap(), launcher.settings().state().read());

    launcher.settings().set_locale("de").unwrap();
    eventually("backend commit", || {
        proxy.get::<SettingState>().is_some_and(|s| s.locale == "de")
    })
    .await;
    assert_eq!(proxy.checkpoint(), 1);

    // frontend mutations only show up once the backend pushes them back
    proxy
        .mutate::<SettingState>(SettingMutation::MaxSocketsSet(4))
        .unwrap();
    eventually("frontend commit", || {
        launcher.settings().state().read().max_sockets == 4
            && proxy.get::<SettingState>().is_some_and(|s| s.max_sockets == 4)
    })
    .await;

    assert!(matches!(
        proxy.mutate::<LaunchState>(lodestone_lib::states::LaunchMutation::LaunchCount(1)),
        Err(ClientError::UnexpectedState { .. })
    ));

    proxy.dispose();
    proxy.dispose();
    assert!(proxy.is_disposed());
    assert!(client.states().is_empty());
    assert!(proxy.mutate::<SettingState>(SettingMutation::LocaleSet("fr".into())).is_err());
}

#[tokio::test]
async fn two_frontends_see_the_same_commits() {
    let (_dir, launcher) = launcher().await;
    let first = launcher.connect();
    let second = launcher.connect();

    let a = first.call_state("UserService", "getUserState", vec![]).await.unwrap();
    let b = second.call_state("UserService", "getUserState", vec![]).await.unwrap();
    assert_ne!(a.session_id(), b.session_id());

    launcher.user().add_yggdrasil_service("https://skins.example.org/api/yggdrasil/");
    for proxy in [&a, &b] {
        eventually("service list push", || {
            proxy.get::<UserState>().is_some_and(|s| {
                s.yggdrasil_services
                    .iter()
                    .any(|api| api.url == "https://skins.example.org/api/yggdrasil")
            })
        })
        .await;
    }
    assert_eq!(a.to_value().unwrap(), b.to_value().unwrap());
}

#[tokio::test]
async fn resync_matches_backend_state() {
    let (_dir, launcher) = launcher().await;
    let client = launcher.connect();
    let proxy = client
        .call_state("SettingService", "getSettings", vec![])
        .await
        .unwrap();

    for locale in ["a", "b", "c"] {
        launcher.settings().set_locale(locale).unwrap();
    }
    eventually("three commits", || proxy.checkpoint() == 3).await;

    proxy.resync().await.unwrap();
    assert_eq!(proxy.checkpoint(), 3);
    assert_eq!(proxy.get::<SettingState>().unwrap().locale, "c");
}

#[tokio::test]
async fn json_lines_carry_calls_commits_and_events() {
    let (_dir, launcher) = launcher().await;
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server_io);
    let (client_read, client_write) = tokio::io::split(client_io);

    let dispatcher = launcher.dispatcher().clone();
    let server = tokio::spawn(lodestone_lib::transport::serve_lines(
        dispatcher,
        server_read,
        server_write,
    ));
    let client = connect_lines(client_read, client_write, descriptor_table());

    let missing = client.call("NoSuchService", "nothing", vec![]).await;
    match missing {
        Err(ClientError::Remote(error)) => {
            assert_eq!(error.kind, "ServiceNotFound");
            assert_eq!(error.service_name.as_deref(), Some("NoSuchService"));
        }
        other => panic!("expected a remote error, got {other:?}"),
    }

    let bad_argument = client
        .call("SettingService", "setMaxSockets", vec![json!("many")])
        .await;
    assert!(matches!(bad_argument, Err(ClientError::Remote(e)) if e.kind == "InvalidArgument"));

    let proxy = client
        .call_state("LaunchService", "getLaunchState", vec![])
        .await
        .unwrap();
    assert_eq!(proxy.get::<LaunchState>().unwrap(), LaunchState::default());

    client
        .call("SettingService", "setLocale", vec![json!("ja")])
        .await
        .unwrap();
    assert_eq!(launcher.settings().state().read().locale, "ja");

    let mut events = client.subscribe_events();
    launcher
        .dispatcher()
        .events()
        .emit("LaunchService", "minecraft-stdout", json!({ "pid": 1, "line": "hi" }));
    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.service_name, "LaunchService");
    assert_eq!(event.payload["line"], "hi");

    drop(client);
    let _ = tokio::time::timeout(Duration::from_secs(5), server).await;
}

#[tokio::test]
async fn newer_subscription_supersedes_older_one() {
    let (_dir, launcher) = launcher().await;
    let client = Arc::new(launcher.connect());
    let latest = LatestSubscription::new();
    let slow_sessions = Arc::new(Mutex::new(Vec::<String>::new()));

    let slow = {
        let client = client.clone();
        let sessions = slow_sessions.clone();
        latest.subscribe(move || async move {
            let proxy = client.call_state("SettingService", "getSettings", vec![]).await?;
            tokio::time::sleep(Duration::from_millis(200)).await;
            sessions.lock().unwrap().push(proxy.session_id().to_string());
            Ok(proxy)
        })
    };
    let fast = {
        let client = client.clone();
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            latest
                .subscribe(move || async move {
                    // the envelope is mirrored only after the older subscription is gone
                    let envelope = client.call("SettingService", "getSettings", vec![]).await?;
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    client.states().receive(envelope)
                })
                .await
        }
    };
    let (slow, fast) = tokio::join!(slow, fast);

    assert!(slow.unwrap().is_none());
    let fast = fast.unwrap().unwrap();
    let current = latest.current().unwrap();
    assert_eq!(current.session_id(), fast.session_id());
    assert!(!current.is_disposed());
    assert_ne!(slow_sessions.lock().unwrap()[0], fast.session_id());
    assert_eq!(client.states().len(), 1);

    launcher.settings().set_locale("de").unwrap();
    eventually("commit on the winning subscription", || {
        current.get::<SettingState>().is_some_and(|s| s.locale == "de")
    })
    .await;

    latest.clear();
    assert!(current.is_disposed());
}

#[tokio::test]
async fn shutdown_persists_settings_and_users() {
    let (dir, launcher) = launcher().await;
    launcher.settings().set_locale("pt-BR").unwrap();
    launcher
        .user()
        .add_yggdrasil_service("https://auth.example.net/api/yggdrasil");
    launcher.shutdown().await;

    let config = LauncherConfig::load(&dir.path().join("config.json")).unwrap();
    assert_eq!(config.locale, "pt-BR");
    let users: UserState =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("user.json")).unwrap())
            .unwrap();
    assert!(users
        .yggdrasil_services
        .iter()
        .any(|api| api.url == "https://auth.example.net/api/yggdrasil"));
    assert!(!users.client_token.is_empty());
}

#[derive(Default)]
struct Inbox {
    commits: Mutex<Vec<lodestone_lib::sync::Commit>>,
}

impl lodestone_lib::sync::CommitSink for Inbox {
    fn push(&self, _session_id: &str, commit: &lodestone_lib::sync::Commit) -> bool {
        self.commits.lock().unwrap().push(commit.clone());
        true
    }
}

fn account(id: &str) -> lodestone_lib::states::UserProfile {
    lodestone_lib::states::UserProfile {
        id: id.to_string(),
        username: format!("{id}@example.org"),
        auth_service: "offline".to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn commits_before_session_activation_arrive_once_in_order() {
    use lodestone_lib::sync::MirrorState;

    let (_dir, launcher) = launcher().await;
    let dispatcher = launcher.dispatcher();
    let inbox = Arc::new(Inbox::default());

    let envelope = dispatcher
        .call("frontend", inbox.clone(), "UserService", "getUserState", vec![])
        .await
        .into_result()
        .unwrap();
    let session = envelope["id"].as_str().unwrap().to_string();
    let length = envelope["length"].as_u64().unwrap();
    let mut mirror: UserState = serde_json::from_value(envelope.clone()).unwrap();

    for id in ["a", "b", "c"] {
        launcher.user().put_user(account(id));
    }
    assert!(inbox.commits.lock().unwrap().is_empty());

    dispatcher.activate(&session);
    dispatcher.activate(&session);
    launcher.user().select_user("b").unwrap();
    launcher.user().put_user(account("d"));

    let commits = inbox.commits.lock().unwrap().clone();
    let seqs: Vec<u64> = commits.iter().map(|c| c.seq).collect();
    assert_eq!(seqs, (length + 1..=length + 5).collect::<Vec<_>>());
    for commit in &commits {
        mirror.apply_record(&commit.mutation).unwrap();
    }
    assert_eq!(mirror, launcher.user().state().read());
    assert_eq!(mirror.selected_user.as_deref(), Some("b"));

    // commits with names the state does not declare change nothing
    dispatcher.commit(
        &session,
        &lodestone_lib::sync::MutationRecord::new("userTeleport", json!({ "x": 1 })),
    );
    assert_eq!(inbox.commits.lock().unwrap().len(), 5);
    assert_eq!(mirror, launcher.user().state().read());
}
