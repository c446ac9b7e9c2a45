//! Durability: restart replay, torn-tail salvage, snapshot recovery.

use std::any::Any;
use std::path::Path;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use skiff_raft::{
    Command, CommandContext, JoinCommand, MemoryHub, Result, Server, ServerConfig, StateMachine,
};

/// Machine that records every applied note, in order.
#[derive(Debug, Clone, Default)]
struct Ledger {
    applied: Arc<Mutex<Vec<String>>>,
}

impl Ledger {
    fn entries(&self) -> Vec<String> {
        self.applied.lock().unwrap().clone()
    }
}

impl StateMachine for Ledger {
    fn save(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&*self.applied.lock().unwrap())?)
    }

    fn recover(&mut self, state: &[u8]) -> Result<()> {
        *self.applied.lock().unwrap() = serde_json::from_slice(state)?;
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NoteCommand {
    note: String,
}

impl NoteCommand {
    fn new(note: impl Into<String>) -> Self {
        Self { note: note.into() }
    }
}

impl Command for NoteCommand {
    fn name(&self) -> &str {
        "ledger:note"
    }

    fn serialize(&self) -> Result<Bytes> {
        Ok(serde_json::to_vec(self)?.into())
    }

    fn apply(&self, ctx: &mut CommandContext<'_>) -> Result<Bytes> {
        let ledger = ctx.machine::<Ledger>()?;
        ledger.applied.lock().unwrap().push(self.note.clone());
        Ok(Bytes::new())
    }
}

fn config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.registry.register::<NoteCommand>("ledger:note");
    config
}

async fn boot(path: &Path, ledger: Ledger) -> Server {
    let hub = MemoryHub::new();
    let server = Server::new(
        "n1",
        path,
        hub.transport("n1"),
        Box::new(ledger),
        config(),
        "mem://n1",
    )
    .await
    .unwrap();
    hub.register(&server);
    server.start().await.unwrap();
    server
}

#[tokio::test]
async fn applied_state_is_rebuilt_from_the_log() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("srv");

    {
        let server = boot(&path, Ledger::default()).await;
        server
            .do_command(&JoinCommand::new("n1", "mem://n1"))
            .await
            .unwrap();
        for i in 1..=5 {
            server
                .do_command(&NoteCommand::new(format!("note{}", i)))
                .await
                .unwrap();
        }
        assert_eq!(server.commit_index(), 6);
        server.stop().await.unwrap();
    }

    // A fresh machine sees exactly the committed history, in order.
    let ledger = Ledger::default();
    let server = boot(&path, ledger.clone()).await;
    assert_eq!(server.commit_index(), 6);
    assert_eq!(
        ledger.entries(),
        vec!["note1", "note2", "note3", "note4", "note5"]
    );
    server.stop().await.unwrap();
}

#[tokio::test]
async fn torn_log_tail_is_discarded_on_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("srv");

    {
        let server = boot(&path, Ledger::default()).await;
        server
            .do_command(&JoinCommand::new("n1", "mem://n1"))
            .await
            .unwrap();
        for i in 1..=5 {
            server
                .do_command(&NoteCommand::new(format!("note{}", i)))
                .await
                .unwrap();
        }
        server.stop().await.unwrap();
    }

    // Chop into the last frame, as a crash mid-write would.
    let log_path = path.join("log");
    let data = std::fs::read(&log_path).unwrap();
    std::fs::write(&log_path, &data[..data.len() - 3]).unwrap();

    let ledger = Ledger::default();
    let server = boot(&path, ledger.clone()).await;
    // The torn entry is gone; everything before it survives.
    assert_eq!(server.commit_index(), 5);
    assert_eq!(ledger.entries(), vec!["note1", "note2", "note3", "note4"]);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn snapshot_plus_log_tail_rebuild_full_state() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("srv");

    {
        let server = boot(&path, Ledger::default()).await;
        server
            .do_command(&JoinCommand::new("n1", "mem://n1"))
            .await
            .unwrap();
        for i in 1..=5 {
            server
                .do_command(&NoteCommand::new(format!("pre{}", i)))
                .await
                .unwrap();
        }
        server.take_snapshot().await.unwrap();
        for i in 1..=3 {
            server
                .do_command(&NoteCommand::new(format!("post{}", i)))
                .await
                .unwrap();
        }
        server.stop().await.unwrap();
    }

    let ledger = Ledger::default();
    let server = boot(&path, ledger.clone()).await;
    assert_eq!(
        ledger.entries(),
        vec!["pre1", "pre2", "pre3", "pre4", "pre5", "post1", "post2", "post3"]
    );
    assert!(!server.is_log_empty());
    server.stop().await.unwrap();
}

mod salvage_properties {
    use bytes::Bytes;
    use proptest::prelude::*;
    use skiff_raft::log::Log;
    use skiff_raft::proto::LogEntry;
    use tempfile::TempDir;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// Cutting the log file anywhere leaves a clean, reusable prefix.
        #[test]
        fn any_cut_leaves_a_decodable_prefix(
            count in 1u64..20,
            cut_frac in 0.0f64..1.0,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let dir = TempDir::new().unwrap();
                let path = dir.path().join("log");

                {
                    let log = Log::open(&path).await.unwrap();
                    for i in 1..=count {
                        log.append(LogEntry::new(
                            i,
                            1,
                            "note",
                            Bytes::from(format!("payload-{}", i)),
                        ))
                        .await
                        .unwrap();
                    }
                }

                let data = std::fs::read(&path).unwrap();
                let cut = ((data.len() as f64) * cut_frac) as usize;
                std::fs::write(&path, &data[..cut]).unwrap();

                let log = Log::open(&path).await.unwrap();
                let kept = log.last_index();
                prop_assert!(kept <= count);
                for entry in log.range(1, kept) {
                    prop_assert_eq!(entry.term, 1);
                    let expected = format!("payload-{}", entry.index);
                    prop_assert_eq!(entry.command.as_ref(), expected.as_bytes());
                }

                // The salvaged log accepts appends at the cut point.
                log.append(LogEntry::new(kept + 1, 1, "note", Bytes::new()))
                    .await
                    .unwrap();
                prop_assert_eq!(log.last_index(), kept + 1);
                Ok(())
            })?;
        }
    }
}
