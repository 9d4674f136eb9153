use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// In-flight progress for one asynchronous attempt. Never authoritative for
/// grading; it only lets a learner resume where they left off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub answers: HashMap<usize, String>,
    pub current_question_index: usize,
    pub timestamp: i64,
}

/// Capability interface over the progress store so the session controller
/// can be tested against an in-memory fake. Missing or unreadable data is
/// "no saved progress", never an error.
pub trait CheckpointStore {
    fn get(&self, assignment_id: &str) -> Option<Checkpoint>;
    fn put(&mut self, assignment_id: &str, checkpoint: &Checkpoint) -> anyhow::Result<()>;
    fn delete(&mut self, assignment_id: &str);
}

/// One JSON file per assignment under `<workspace>/checkpoints/`.
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, assignment_id: &str) -> PathBuf {
        self.dir.join(format!("quiz_progress_{}.json", assignment_id))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn get(&self, assignment_id: &str) -> Option<Checkpoint> {
        let text = std::fs::read_to_string(self.path_for(assignment_id)).ok()?;
        serde_json::from_str(&text).ok()
    }

    fn put(&mut self, assignment_id: &str, checkpoint: &Checkpoint) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir).with_context(|| {
            format!("failed to create checkpoint dir {}", self.dir.to_string_lossy())
        })?;
        let path = self.path_for(assignment_id);
        let tmp = path.with_extension("json.saving");
        let text = serde_json::to_string(checkpoint).context("serialize checkpoint")?;
        std::fs::write(&tmp, text)
            .with_context(|| format!("failed to write {}", tmp.to_string_lossy()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("failed to move checkpoint into {}", path.to_string_lossy()))?;
        Ok(())
    }

    fn delete(&mut self, assignment_id: &str) {
        let _ = std::fs::remove_file(self.path_for(assignment_id));
    }
}

/// Test double for the session controller.
#[allow(dead_code)]
#[derive(Default)]
pub struct MemoryCheckpointStore {
    entries: HashMap<String, Checkpoint>,
}

impl CheckpointStore for MemoryCheckpointStore {
    fn get(&self, assignment_id: &str) -> Option<Checkpoint> {
        self.entries.get(assignment_id).cloned()
    }

    fn put(&mut self, assignment_id: &str, checkpoint: &Checkpoint) -> anyhow::Result<()> {
        self.entries.insert(assignment_id.to_string(), checkpoint.clone());
        Ok(())
    }

    fn delete(&mut self, assignment_id: &str) {
        self.entries.remove(assignment_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint() -> Checkpoint {
        let mut answers = HashMap::new();
        answers.insert(0, "Paris".to_string());
        answers.insert(2, "True".to_string());
        Checkpoint {
            answers,
            current_question_index: 2,
            timestamp: 1_700_000_000_000,
        }
    }

    #[test]
    fn file_store_round_trips_and_deletes() {
        let dir = std::env::temp_dir().join(format!(
            "quizdesk-checkpoints-{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        let mut store = FileCheckpointStore::new(dir);
        assert!(store.get("a1").is_none());

        let cp = checkpoint();
        store.put("a1", &cp).expect("put");
        assert_eq!(store.get("a1"), Some(cp.clone()));

        // Overwrite wins.
        let mut cp2 = cp;
        cp2.current_question_index = 3;
        store.put("a1", &cp2).expect("put again");
        assert_eq!(store.get("a1").map(|c| c.current_question_index), Some(3));

        store.delete("a1");
        assert!(store.get("a1").is_none());
        // Deleting a missing checkpoint is a no-op.
        store.delete("a1");
    }

    #[test]
    fn corrupt_file_reads_as_no_saved_progress() {
        let dir = std::env::temp_dir().join(format!(
            "quizdesk-checkpoints-corrupt-{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("create dir");
        std::fs::write(dir.join("quiz_progress_a1.json"), "{not json").expect("write");
        let store = FileCheckpointStore::new(dir);
        assert!(store.get("a1").is_none());
    }
}
