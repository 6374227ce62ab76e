//! Record command handlers

use anyhow::{bail, Context, Result};
use serde_json::Value;
use uuid::Uuid;

use tally_core::{Record, RecordQuery};

use crate::commands::Session;
use crate::output::Output;

/// Parse a `key=value` field argument
///
/// Values that parse as JSON keep their type (`total=42`, `paid=true`);
/// anything else is stored as a string.
pub fn parse_field(arg: &str) -> Result<(String, Value), String> {
    let Some((key, value)) = arg.split_once('=') else {
        return Err(format!("expected key=value, got '{}'", arg));
    };
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("missing field name in '{}'", arg));
    }

    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

/// Add a new record
pub async fn add(
    session: &Session,
    kind: String,
    fields: Vec<(String, Value)>,
    output: &Output,
) -> Result<()> {
    let mut record = Record::new(kind);
    for (key, value) in fields {
        record.set(key, value);
    }

    session.manager.insert(&record).await?;

    if output.is_quiet() {
        println!("{}", record.id);
    } else {
        output.success(&format!("Added {} {}", record.kind, record.id));
    }
    Ok(())
}

/// List records, optionally filtered
pub fn list(
    session: &Session,
    kind: Option<String>,
    equals: Vec<(String, Value)>,
    limit: Option<usize>,
    output: &Output,
) -> Result<()> {
    let mut query = RecordQuery::new();
    if let Some(kind) = kind {
        query = query.kind(kind);
    }
    for (field, value) in equals {
        query = query.field_eq(field, value);
    }
    if let Some(limit) = limit {
        query = query.limit(limit);
    }

    let records = session.manager.query(&query)?;
    output.print_records(&records);
    Ok(())
}

/// Show one record
pub fn show(session: &Session, id: String, output: &Output) -> Result<()> {
    let record = find(session, &id)?;
    output.print_record(&record);
    Ok(())
}

/// Set or remove fields on a record
pub async fn set(
    session: &Session,
    id: String,
    fields: Vec<(String, Value)>,
    unset: Vec<String>,
    output: &Output,
) -> Result<()> {
    if fields.is_empty() && unset.is_empty() {
        bail!("Nothing to change. Use --field key=value or --unset key.");
    }

    let mut record = find(session, &id)?;
    for (key, value) in fields {
        record.set(key, value);
    }
    for key in unset {
        record.remove(&key);
    }

    session.manager.update(&record).await?;
    output.success(&format!("Updated {}", record.id));
    Ok(())
}

/// Delete a record
pub async fn delete(session: &Session, id: String, output: &Output) -> Result<()> {
    let record = find(session, &id)?;
    session.manager.delete(record.id).await?;
    output.success(&format!("Deleted {} {}", record.kind, record.id));
    Ok(())
}

/// Full-text search
pub fn search(session: &Session, query: String, output: &Output) -> Result<()> {
    let records = session.manager.search(&query)?;
    output.print_records(&records);
    Ok(())
}

/// Find a record by full UUID or unique prefix
fn find(session: &Session, id: &str) -> Result<Record> {
    if let Ok(uuid) = Uuid::parse_str(id) {
        return session
            .manager
            .get(uuid)?
            .with_context(|| format!("Record not found: {}", id));
    }

    let prefix = id.to_lowercase();
    let mut matches: Vec<Record> = session
        .manager
        .list(None)?
        .into_iter()
        .filter(|r| r.id.to_string().starts_with(&prefix))
        .collect();

    match matches.len() {
        0 => bail!("Record not found: {}", id),
        1 => Ok(matches.remove(0)),
        n => bail!("Ambiguous ID '{}' matches {} records, use more characters", id, n),
    }
}
