//! FIFO queues stored inside a shared memory segment.
//!
//! A queue named `key` keeps a `{head, tail}` cursor record under `key` and
//! one record per element under `key/<sequence>`, so popping decodes only the
//! front element.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::shared_memory::ScopedAccess;
use crate::error::Result;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct QueueCursor {
    head: u64,
    tail: u64,
}

/// Queue view borrowed from a [`ScopedAccess`].
pub struct SharedQueue<'s, 'a, T> {
    access: &'s mut ScopedAccess<'a>,
    key: String,
    cursor: QueueCursor,
    _marker: PhantomData<fn() -> T>,
}

impl<'s, 'a, T> SharedQueue<'s, 'a, T>
where
    T: Serialize + DeserializeOwned,
{
    pub(crate) fn open(access: &'s mut ScopedAccess<'a>, key: &str) -> Result<Self> {
        let cursor = access.value_or_default(key)?;
        Ok(Self {
            access,
            key: key.to_string(),
            cursor,
            _marker: PhantomData,
        })
    }

    pub fn len(&self) -> usize {
        (self.cursor.tail - self.cursor.head) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.cursor.head == self.cursor.tail
    }

    /// Append `value`. On failure the queue is left unchanged.
    pub fn push_back(&mut self, value: &T) -> Result<()> {
        let element_key = self.element_key(self.cursor.tail);
        let bytes = serde_json::to_vec(value)?;
        self.access.insert_bytes(&element_key, bytes)?;

        let cursor = QueueCursor {
            head: self.cursor.head,
            tail: self.cursor.tail + 1,
        };
        if let Err(e) = self.access.set_value(&self.key, &cursor) {
            self.access.remove_value(&element_key);
            return Err(e);
        }
        self.cursor = cursor;
        Ok(())
    }

    /// Decode the front element without removing it.
    pub fn front(&self) -> Result<Option<T>> {
        if self.is_empty() {
            return Ok(None);
        }
        match self.access.raw_value(&self.element_key(self.cursor.head)) {
            Some(bytes) => Ok(Some(serde_json::from_slice(bytes)?)),
            None => Ok(None),
        }
    }

    /// Decode every element, front first, without removing any.
    pub fn values(&self) -> Result<Vec<T>> {
        (self.cursor.head..self.cursor.tail)
            .filter_map(|sequence| self.access.raw_value(&self.element_key(sequence)))
            .map(|bytes| Ok(serde_json::from_slice(bytes)?))
            .collect()
    }

    /// Remove and return the front element.
    pub fn pop_front(&mut self) -> Result<Option<T>> {
        let Some(value) = self.front()? else {
            return Ok(None);
        };

        let element_key = self.element_key(self.cursor.head);
        self.access.remove_value(&element_key);
        self.cursor.head += 1;
        self.store_cursor()?;
        Ok(Some(value))
    }

    /// Remove and return every element in order.
    pub fn drain(&mut self) -> Result<Vec<T>> {
        let mut values = Vec::with_capacity(self.len());
        while let Some(value) = self.pop_front()? {
            values.push(value);
        }
        Ok(values)
    }

    pub fn clear(&mut self) -> Result<()> {
        self.access.remove_prefixed(&format!("{}/", self.key));
        self.cursor = QueueCursor::default();
        self.store_cursor()
    }

    fn store_cursor(&mut self) -> Result<()> {
        if self.is_empty() {
            // Restart sequence numbers so element keys stay short.
            self.cursor = QueueCursor::default();
            self.access.remove_value(&self.key);
            return Ok(());
        }
        self.access.set_value(&self.key, &self.cursor)
    }

    fn element_key(&self, sequence: u64) -> String {
        format!("{}/{}", self.key, sequence)
    }
}
