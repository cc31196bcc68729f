//! Table registry: resolves table ids and names to their page files.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use log::{debug, info};
use parking_lot::RwLock;

use crate::config::StorageConfig;
use crate::file::{DbFile, FileId, HeapFile};
use crate::record::{FieldType, Schema};
use crate::{Result, StorageError};

#[derive(Debug, Clone)]
struct Table {
    file: Arc<dyn DbFile>,
    name: String,
    primary_key: Option<String>,
}

#[derive(Debug, Default)]
pub struct Catalog {
    tables: RwLock<HashMap<FileId, Table>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `file` under `name`, replacing any table that already uses
    /// the same id or the same name.
    pub fn add_table(&self, file: Arc<dyn DbFile>, name: &str, primary_key: Option<&str>) {
        let id = file.id();
        let mut tables = self.tables.write();
        tables.retain(|tid, t| *tid != id && t.name != name);
        tables.insert(
            id,
            Table {
                file,
                name: name.to_string(),
                primary_key: primary_key.map(str::to_string),
            },
        );
        debug!("Registered table {} with id {}", name, id);
    }

    pub fn table_id(&self, name: &str) -> Result<FileId> {
        self.tables
            .read()
            .iter()
            .find(|(_, t)| t.name == name)
            .map(|(id, _)| *id)
            .ok_or_else(|| StorageError::TableNotFound(name.to_string()))
    }

    /// The file store backing table `id`.
    pub fn file(&self, id: FileId) -> Result<Arc<dyn DbFile>> {
        self.with_table(id, |t| t.file.clone())
    }

    pub fn schema(&self, id: FileId) -> Result<Arc<Schema>> {
        self.with_table(id, |t| t.file.schema().clone())
    }

    pub fn table_name(&self, id: FileId) -> Result<String> {
        self.with_table(id, |t| t.name.clone())
    }

    pub fn primary_key(&self, id: FileId) -> Result<Option<String>> {
        self.with_table(id, |t| t.primary_key.clone())
    }

    pub fn table_ids(&self) -> Vec<FileId> {
        let mut ids: Vec<_> = self.tables.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn clear(&self) {
        self.tables.write().clear();
    }

    /// Reads a schema file with one table per line,
    /// `name (field type [pk], ...)` where type is `int` or `string`, and
    /// opens `<name>.dat` next to it for each table.
    pub fn load_schema(&self, path: &Path, config: &StorageConfig) -> Result<()> {
        let base = path
            .canonicalize()?
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let text = fs::read_to_string(path)?;

        for (index, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let (name, schema, primary_key) = parse_table(line).map_err(|reason| {
                StorageError::CatalogParse {
                    line: index + 1,
                    reason,
                }
            })?;
            let file = HeapFile::open(&base.join(format!("{}.dat", name)), Arc::new(schema), config)?;
            info!("Added table {} with schema {}", name, file.schema());
            self.add_table(Arc::new(file), &name, primary_key.as_deref());
        }
        Ok(())
    }

    fn with_table<T>(&self, id: FileId, f: impl FnOnce(&Table) -> T) -> Result<T> {
        self.tables
            .read()
            .get(&id)
            .map(f)
            .ok_or_else(|| StorageError::TableNotFound(id.to_string()))
    }
}

fn parse_table(line: &str) -> std::result::Result<(String, Schema, Option<String>), String> {
    let open = line.find('(').ok_or("missing '('")?;
    let close = line.rfind(')').ok_or("missing ')'")?;
    if close < open {
        return Err("')' before '('".to_string());
    }
    let name = line[..open].trim();
    if name.is_empty() {
        return Err("missing table name".to_string());
    }

    let mut fields = Vec::new();
    let mut primary_key = None;
    for column in line[open + 1..close].split(',') {
        let parts: Vec<_> = column.split_whitespace().collect();
        let (field, ty) = match parts.as_slice() {
            [field, ty] | [field, ty, _] => (*field, *ty),
            _ => return Err(format!("bad column definition '{}'", column.trim())),
        };
        let field_type = match ty.to_lowercase().as_str() {
            "int" => FieldType::Int,
            "string" => FieldType::text(),
            other => return Err(format!("unknown type {}", other)),
        };
        if let [_, _, annotation] = parts.as_slice() {
            if *annotation != "pk" {
                return Err(format!("unknown annotation {}", annotation));
            }
            primary_key = Some(field.to_string());
        }
        fields.push((field_type, field));
    }

    let schema = Schema::with_names(fields).map_err(|e| e.to_string())?;
    Ok((name.to_string(), schema, primary_key))
}
