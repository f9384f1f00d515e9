//! Deterministic reconstruction of `artifacts/progress.md` from a task's
//! Journal (Section 4.7 step 4, template in Section 6).
//!
//! Rebuilt from scratch on every step rather than appended to, so a step
//! replayed after a crash produces byte-identical output regardless of which
//! host it runs on: entries are rendered in stable order (step_index, then
//! role arrival order) with UTC timestamps.

use norma_core::{Id, JournalEntry};

/// Render the full progress document for `task_id` from its Journal.
pub fn render(task_id: &Id, journal: &[JournalEntry]) -> String {
    let mut entries: Vec<&JournalEntry> = journal.iter().collect();
    entries.sort_by_key(|e| (e.step_index, role_order(e.role)));

    let mut out = String::new();
    for entry in entries {
        render_entry(&mut out, task_id, entry);
    }
    out
}

fn role_order(role: norma_core::Role) -> u8 {
    match role {
        norma_core::Role::Plan => 0,
        norma_core::Role::Do => 1,
        norma_core::Role::Check => 2,
        norma_core::Role::Act => 3,
    }
}

fn render_entry(out: &mut String, task_id: &Id, entry: &JournalEntry) {
    let ts = entry.timestamp.format("%Y-%m-%dT%H:%M:%SZ");
    let role_upper = entry.role.as_str().to_uppercase();
    let stop_reason = entry.stop_reason.as_deref().unwrap_or("");
    out.push_str(&format!(
        "## {ts} — {} {role_upper} — {}/{stop_reason}\n",
        entry.step_index, entry.status
    ));
    out.push_str(&format!("**Task:** {task_id}\n"));
    out.push_str(&format!(
        "**Run:** {} · **Iteration:** {}\n\n",
        entry.run_id, entry.iteration
    ));
    out.push_str(&format!("**Title:** {}\n\n", entry.title));
    out.push_str("**Details:**\n");
    for detail in &entry.details {
        out.push_str(&format!("- {detail}\n"));
    }
    out.push('\n');
}
