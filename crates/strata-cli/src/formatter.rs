//! Output formatting for command results.

use clap::ValueEnum;
use comfy_table::Table;
use serde::Serialize;

use strata_backup::BackupStatistics;
use strata_core::migration::{MigrateReport, MigrationStatusReport};
use strata_core::{BackupInfo, RestoreInfo};

/// Output format for results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format
    Table,
    /// JSON format
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Table => write!(f, "table"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("{{\"error\": \"{}\"}}", e))
}

fn timestamp(at: Option<chrono::DateTime<chrono::Utc>>) -> String {
    at.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// Human-readable byte count.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

pub fn format_backups(format: OutputFormat, backups: &[BackupInfo]) -> String {
    if format == OutputFormat::Json {
        return to_json(backups);
    }
    if backups.is_empty() {
        return "No backups".to_string();
    }

    let mut table = Table::new();
    table.set_header(vec!["ID", "Type", "Status", "Started", "Size", "Remote"]);
    for backup in backups {
        table.add_row(vec![
            backup.backup_id.clone(),
            backup.backup_type.to_string(),
            backup.status.to_string(),
            timestamp(Some(backup.started_at)),
            format_size(backup.size_bytes),
            backup.remote_key().unwrap_or("-").to_string(),
        ]);
    }
    table.to_string()
}

pub fn format_backup(format: OutputFormat, backup: &BackupInfo) -> String {
    match format {
        OutputFormat::Json => to_json(backup),
        OutputFormat::Table => format_backups(format, std::slice::from_ref(backup)),
    }
}

pub fn format_statistics(format: OutputFormat, stats: &BackupStatistics) -> String {
    if format == OutputFormat::Json {
        return to_json(stats);
    }

    let mut summary = Table::new();
    summary.set_header(vec!["Total", "Completed", "Failed", "Size", "Oldest", "Newest"]);
    summary.add_row(vec![
        stats.total_backups.to_string(),
        stats.completed_backups.to_string(),
        stats.failed_backups.to_string(),
        format_size(stats.total_size_bytes),
        timestamp(stats.oldest_backup),
        timestamp(stats.newest_backup),
    ]);

    let mut by_type = Table::new();
    by_type.set_header(vec!["Type", "Count", "Size", "Oldest", "Newest"]);
    for (backup_type, entry) in &stats.by_type {
        by_type.add_row(vec![
            backup_type.to_string(),
            entry.count.to_string(),
            format_size(entry.total_size_bytes),
            timestamp(entry.oldest),
            timestamp(entry.newest),
        ]);
    }

    format!("{}\n\n{}", summary, by_type)
}

pub fn format_restores(format: OutputFormat, restores: &[RestoreInfo]) -> String {
    if format == OutputFormat::Json {
        return to_json(restores);
    }
    if restores.is_empty() {
        return "No restores".to_string();
    }

    let mut table = Table::new();
    table.set_header(vec!["ID", "Backup/Source", "Target", "Status", "Started", "Error"]);
    for restore in restores {
        table.add_row(vec![
            restore.restore_id.clone(),
            restore.backup_id.clone(),
            restore.target_database.clone(),
            restore.status.to_string(),
            timestamp(Some(restore.started_at)),
            restore.error_message.clone().unwrap_or_default(),
        ]);
    }
    table.to_string()
}

pub fn format_restore(format: OutputFormat, restore: &RestoreInfo) -> String {
    match format {
        OutputFormat::Json => to_json(restore),
        OutputFormat::Table => format_restores(format, std::slice::from_ref(restore)),
    }
}

pub fn format_migrate_report(format: OutputFormat, report: &MigrateReport) -> String {
    if format == OutputFormat::Json {
        return to_json(report);
    }

    let mut lines = Vec::new();
    if report.is_noop() {
        lines.push("Schema is up to date".to_string());
    }
    for record in &report.applied {
        lines.push(format!(
            "applied {} ({} ms): {}",
            record.version, record.execution_time_ms, record.description
        ));
    }
    for blocked in &report.blocked {
        lines.push(format!(
            "blocked {}: waiting for {}",
            blocked.version,
            blocked.unmet.join(", ")
        ));
    }
    lines.join("\n")
}

pub fn format_migration_status(format: OutputFormat, report: &MigrationStatusReport) -> String {
    if format == OutputFormat::Json {
        return to_json(report);
    }

    let mut table = Table::new();
    table.set_header(vec!["Version", "State", "Description", "Applied"]);
    for record in &report.applied {
        let state = if report.drifted.contains(&record.version) {
            "drifted"
        } else {
            "applied"
        };
        table.add_row(vec![
            record.version.clone(),
            state.to_string(),
            record.description.clone(),
            timestamp(Some(record.applied_at)),
        ]);
    }
    for record in &report.missing {
        table.add_row(vec![
            record.version.clone(),
            "missing definition".to_string(),
            record.description.clone(),
            timestamp(Some(record.applied_at)),
        ]);
    }
    for pending in &report.pending {
        let state = if pending.unmet_dependencies.is_empty() {
            "pending".to_string()
        } else {
            format!("blocked on {}", pending.unmet_dependencies.join(", "))
        };
        table.add_row(vec![
            pending.version.clone(),
            state,
            pending.description.clone(),
            "-".to_string(),
        ]);
    }
    table.to_string()
}

pub fn format_list(format: OutputFormat, label: &str, items: &[String]) -> String {
    match format {
        OutputFormat::Json => to_json(items),
        OutputFormat::Table if items.is_empty() => format!("No {}", label),
        OutputFormat::Table => items
            .iter()
            .map(|item| format!("{} {}", label, item))
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use strata_core::BackupType;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.5 KiB");
        assert_eq!(format_size(5 * 1024 * 1024 * 1024), "5.0 GiB");
    }

    #[test]
    fn test_backups_table_and_json() {
        let mut backup = BackupInfo::in_progress("b1", BackupType::Full, "/b/b1.dump", Utc::now());
        backup.complete(2048, "abc", Utc::now());

        let table = format_backups(OutputFormat::Table, &[backup.clone()]);
        assert!(table.contains("b1"));
        assert!(table.contains("2.0 KiB"));

        let json = format_backups(OutputFormat::Json, &[backup]);
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed[0]["backup_id"], "b1");
        assert_eq!(parsed[0]["status"], "completed");
    }

    #[test]
    fn test_empty_lists() {
        assert_eq!(format_backups(OutputFormat::Table, &[]), "No backups");
        assert_eq!(format_list(OutputFormat::Table, "reverted", &[]), "No reverted");
        assert_eq!(format_list(OutputFormat::Json, "reverted", &[]), "[]");
    }
}
