use std::path::PathBuf;

use serde::{de::DeserializeOwned, Serialize};
use tokio::fs::{create_dir_all, read_to_string, write};

use crate::error::StreamerResult;

/*
    A value mirrored to a JSON file. Mutation only touches memory and marks the value
dirty; `flush` writes it back. This keeps mutation usable from synchronous code that
owns the value, with the write happening at the next await point of the owner.
*/
pub struct FileBackedValue<T> {
    value: T,
    path: Option<PathBuf>,
    dirty: bool,
}
impl<T: Serialize + DeserializeOwned> FileBackedValue<T> {
    pub async fn new(path: PathBuf, default: impl FnOnce() -> T) -> StreamerResult<FileBackedValue<T>> {
        let value = if path.exists() {
            serde_json::from_str(&read_to_string(&path).await?)?
        } else {
            if let Some(parent) = path.parent() {
                create_dir_all(parent).await?;
            }
            default()
        };
        Ok(FileBackedValue {
            value,
            path: Some(path),
            dirty: false,
        })
    }
    pub fn in_memory(value: T) -> Self {
        FileBackedValue {
            value,
            path: None,
            dirty: false,
        }
    }
    pub fn get(&self) -> &T {
        &self.value
    }
    pub fn mutate<R>(&mut self, f: impl FnOnce(&mut T) -> R) -> R {
        self.dirty = true;
        f(&mut self.value)
    }
    pub fn is_dirty(&self) -> bool {
        self.dirty && self.path.is_some()
    }
    pub async fn flush(&mut self) -> StreamerResult<()> {
        if let (true, Some(path)) = (self.dirty, &self.path) {
            write(path, serde_json::to_string_pretty(&self.value)?).await?;
        }
        self.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tempdir::TempDir;

    use super::*;

    #[tokio::test]
    async fn test_value_survives_reload() {
        let dir = TempDir::new("file_backed").unwrap();
        let path = dir.path().join("nested").join("value.json");
        let mut value: FileBackedValue<BTreeMap<String, u32>> =
            FileBackedValue::new(path.clone(), BTreeMap::new).await.unwrap();
        value.mutate(|map| map.insert("answer".to_string(), 42));
        assert!(value.is_dirty());
        value.flush().await.unwrap();
        assert!(!value.is_dirty());

        let reloaded: FileBackedValue<BTreeMap<String, u32>> =
            FileBackedValue::new(path, BTreeMap::new).await.unwrap();
        assert_eq!(reloaded.get().get("answer"), Some(&42));
    }

    #[tokio::test]
    async fn test_in_memory_never_dirty() {
        let mut value = FileBackedValue::in_memory(3u8);
        value.mutate(|v| *v += 1);
        assert!(!value.is_dirty());
        value.flush().await.unwrap();
        assert_eq!(*value.get(), 4);
    }
}
