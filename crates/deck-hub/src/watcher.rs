use deck_core::ConfigStore;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const RELOAD_DEBOUNCE_MS: u64 = 250;

/// Watches the config file's directory (editors often replace the file
/// rather than write it in place) and reloads the store after changes
/// settle. Dropping the returned watcher stops the reload task.
pub fn spawn(store: Arc<ConfigStore>) -> notify::Result<RecommendedWatcher> {
    let path = store.path().to_path_buf();
    let file_name = path.file_name().map(OsStr::to_os_string).unwrap_or_default();
    let (event_tx, event_rx) = mpsc::unbounded_channel::<()>();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            if touches_file(&event, &file_name) {
                let _ = event_tx.send(());
            }
        }
        Err(err) => warn!(event = "watch_error", error = %err),
    })?;
    let dir = watch_dir(&path);
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    info!(event = "config_watch", dir = %dir.display());
    tokio::spawn(reload_loop(store, event_rx));
    Ok(watcher)
}

fn watch_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn touches_file(event: &Event, file_name: &OsString) -> bool {
    let relevant = matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    );
    relevant
        && event
            .paths
            .iter()
            .any(|path| path.file_name() == Some(file_name.as_os_str()))
}

async fn reload_loop(store: Arc<ConfigStore>, mut event_rx: mpsc::UnboundedReceiver<()>) {
    let debounce = Duration::from_millis(RELOAD_DEBOUNCE_MS);
    let mut pending = false;
    loop {
        tokio::select! {
            received = event_rx.recv() => {
                if received.is_none() {
                    break;
                }
                pending = true;
            }
            _ = tokio::time::sleep(debounce), if pending => {
                pending = false;
                debug!(event = "config_changed", path = %store.path().display());
                let store = store.clone();
                // Failures are logged by the store and leave the old snapshot active.
                if let Err(err) = tokio::task::spawn_blocking(move || store.reload()).await {
                    error!(event = "reload_panic", error = %err);
                }
            }
        }
    }
    debug!(event = "config_watch_stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, ModifyKind};
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn only_changes_to_the_config_file_count() {
        let name = OsString::from("devdeck.toml");
        let modify = Event::new(EventKind::Modify(ModifyKind::Any)).add_path("/tmp/x/devdeck.toml".into());
        let create = Event::new(EventKind::Create(CreateKind::File)).add_path("/tmp/x/devdeck.toml".into());
        let other = Event::new(EventKind::Modify(ModifyKind::Any)).add_path("/tmp/x/other.toml".into());
        let access = Event::new(EventKind::Access(AccessKind::Any)).add_path("/tmp/x/devdeck.toml".into());
        assert!(touches_file(&modify, &name));
        assert!(touches_file(&create, &name));
        assert!(!touches_file(&other, &name));
        assert!(!touches_file(&access, &name));
    }

    #[test]
    fn bare_file_name_watches_current_dir() {
        assert_eq!(watch_dir(Path::new("devdeck.toml")), PathBuf::from("."));
        assert_eq!(watch_dir(Path::new("/etc/devdeck/devdeck.toml")), PathBuf::from("/etc/devdeck"));
    }

    #[tokio::test]
    async fn file_change_reloads_the_store() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("devdeck.toml");
        fs::write(&path, "[[commands]]\nuuid = \"before\"\ncontext = \"main\"\n").expect("write");
        let store = Arc::new(ConfigStore::open(&path).expect("open"));
        let _watcher = spawn(store.clone()).expect("watcher");

        fs::write(&path, "[[commands]]\nuuid = \"after\"\ncontext = \"main\"\n").expect("rewrite");

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while store.current().commands.first().map(|c| c.id.as_str()) != Some("after") {
            assert!(tokio::time::Instant::now() < deadline, "reload did not happen");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(store.current().generation >= 2);
    }
}
