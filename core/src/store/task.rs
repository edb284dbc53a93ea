use super::{LedgerStore, Task};
use crate::error::LedgerResult;
use rusqlite::{params, OptionalExtension};

impl LedgerStore {
    // ── Task catalog ──────────────────────────────────────────────

    /// Insert or replace a task definition. The catalog itself is managed
    /// elsewhere; the ledger only needs reward and repeatability.
    pub fn upsert_task(&self, task: &Task) -> LedgerResult<()> {
        self.conn.execute(
            "INSERT INTO tasks (task_id, reward, one_shot, active) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (task_id) DO UPDATE SET
                 reward = excluded.reward,
                 one_shot = excluded.one_shot,
                 active = excluded.active",
            params![task.task_id, task.reward, task.one_shot, task.active],
        )?;
        Ok(())
    }

    pub fn task(&self, task_id: &str) -> LedgerResult<Option<Task>> {
        let task = self
            .conn
            .query_row(
                "SELECT task_id, reward, one_shot, active FROM tasks WHERE task_id = ?1",
                params![task_id],
                |row| {
                    Ok(Task {
                        task_id: row.get(0)?,
                        reward: row.get(1)?,
                        one_shot: row.get(2)?,
                        active: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(task)
    }
}
