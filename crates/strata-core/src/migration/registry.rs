//! Explicit registration of migration definitions.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::definition::{Migration, SqlMigration};
use super::error::MigrationError;

/// Collects migration definitions before they are handed to a migrator.
///
/// Duplicate versions are accepted here and rejected by
/// [`Migrator::load`](super::Migrator::load).
#[derive(Debug, Default, Clone)]
pub struct MigrationRegistry {
    migrations: Vec<Migration>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one migration.
    pub fn register(&mut self, migration: Migration) -> &mut Self {
        self.migrations.push(migration);
        self
    }

    /// Register several migrations.
    pub fn extend(&mut self, migrations: impl IntoIterator<Item = Migration>) -> &mut Self {
        self.migrations.extend(migrations);
        self
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Migration> {
        self.migrations.iter()
    }

    pub fn into_vec(self) -> Vec<Migration> {
        self.migrations
    }
}

/// Header values read from the leading `-- key: value` comments of `up.sql`.
#[derive(Debug, Default)]
struct Header {
    description: Option<String>,
    author: Option<String>,
    depends: Vec<String>,
    pre_check: Option<String>,
    post_check: Option<String>,
}

fn parse_header(sql: &str) -> Header {
    let mut header = Header::default();
    for line in sql.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some(comment) = line.strip_prefix("--") else {
            break;
        };
        let Some((key, value)) = comment.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim().to_ascii_lowercase().as_str() {
            "description" => header.description = Some(value.to_string()),
            "author" => header.author = Some(value.to_string()),
            "depends" => header.depends.extend(
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(str::to_string),
            ),
            "pre_check" => header.pre_check = Some(value.to_string()),
            "post_check" => header.post_check = Some(value.to_string()),
            _ => {}
        }
    }
    header
}

/// Split a directory name `<version>_<slug>` into version and slug.
///
/// Versions of the form `YYYYMMDD_HHMMSS` keep their inner underscore.
fn split_dir_name(name: &str) -> (String, String) {
    let parts: Vec<&str> = name.splitn(3, '_').collect();
    fn is_digits(s: &str) -> bool {
        !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
    }

    match parts.as_slice() {
        [date, time, slug] if is_digits(date) && is_digits(time) => {
            (format!("{}_{}", date, time), slug.to_string())
        }
        [date, time] if is_digits(date) && is_digits(time) => (format!("{}_{}", date, time), String::new()),
        [version, rest @ ..] => (version.to_string(), rest.join("_")),
        [] => (String::new(), String::new()),
    }
}

fn read(path: &Path) -> Result<String, MigrationError> {
    fs::read_to_string(path).map_err(|source| MigrationError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Load SQL migrations from `dir`.
///
/// Each migration is a subdirectory named `<version>_<slug>` holding `up.sql`
/// and `down.sql`. `up.sql` may start with header comments:
///
/// ```sql
/// -- description: create users table
/// -- author: ops
/// -- depends: 20240101_000000, 20240102_000000
/// -- post_check: SELECT count(*) = 0 FROM users
/// CREATE TABLE users (id INTEGER PRIMARY KEY);
/// ```
///
/// Without a description header the slug (underscores as spaces) is used.
pub fn load_sql_directory(dir: &Path) -> Result<Vec<Migration>, MigrationError> {
    let entries = fs::read_dir(dir).map_err(|source| MigrationError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut dirs: Vec<PathBuf> = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| MigrationError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        if entry.path().is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();

    let mut migrations = Vec::with_capacity(dirs.len());
    for path in dirs {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (version, slug) = split_dir_name(&name);

        let up_path = path.join("up.sql");
        let down_path = path.join("down.sql");
        if !up_path.is_file() || !down_path.is_file() {
            return Err(MigrationError::InvalidDefinition(format!(
                "{} must contain up.sql and down.sql",
                path.display()
            )));
        }

        let up = read(&up_path)?;
        let down = read(&down_path)?;
        let header = parse_header(&up);

        let mut ops = SqlMigration::new([up], [down]);
        if let Some(check) = header.pre_check {
            ops = ops.with_pre_check(check);
        }
        if let Some(check) = header.post_check {
            ops = ops.with_post_check(check);
        }

        let description = header.description.unwrap_or_else(|| slug.replace('_', " "));
        let migration = Migration::new(version, description, ops)?
            .with_author(header.author.unwrap_or_default())
            .with_dependencies(header.depends);

        debug!(version = migration.version(), path = %path.display(), "loaded sql migration");
        migrations.push(migration);
    }

    Ok(migrations)
}
