// Copyright 2025 The virtio-vstream Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Table of the sessions currently opened on a device.
//!
//! The table hands sessions out behind `Arc<Mutex<_>>`, so a command being
//! processed on one session never holds the table lock. A consequence the
//! protocol makes no attempt to hide is that a CLOSE command can succeed
//! while an ioctl on the same session is still in flight; the ioctl completes
//! against session state that is no longer in the table.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionTableError {
    #[error("maximum number of concurrent sessions reached")]
    LimitReached,
    #[error("device has been shut down")]
    ShutDown,
}

impl SessionTableError {
    pub fn into_errno(self) -> i32 {
        match self {
            SessionTableError::LimitReached => libc::EMFILE,
            SessionTableError::ShutDown => libc::ENODEV,
        }
    }
}

struct Inner<S> {
    sessions: HashMap<u32, Arc<Mutex<S>>>,
    /// Once set, no new session can ever be created.
    shut_down: bool,
}

/// Set of currently opened sessions, indexed by session id.
pub struct SessionTable<S> {
    inner: Mutex<Inner<S>>,
    limit: usize,
}

impl<S> SessionTable<S> {
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                sessions: HashMap::new(),
                shut_down: false,
            }),
            limit,
        }
    }

    /// Allocates an id and inserts the session built by `create` under it.
    ///
    /// Ids are the lowest non-negative integers not currently in use, so the
    /// id of a closed session is eventually reused. `create` runs with the
    /// table locked; if it fails, no id is consumed.
    pub fn add_with<F>(&self, create: F) -> Result<u32, i32>
    where
        F: FnOnce(u32) -> Result<S, i32>,
    {
        let mut inner = self.inner.lock().unwrap();

        if inner.shut_down {
            return Err(SessionTableError::ShutDown.into_errno());
        }
        if inner.sessions.len() >= self.limit {
            return Err(SessionTableError::LimitReached.into_errno());
        }

        // The table is bounded by `limit` so this terminates.
        let id = (0..)
            .find(|id| !inner.sessions.contains_key(id))
            .unwrap_or(0);

        let session = create(id)?;
        inner.sessions.insert(id, Arc::new(Mutex::new(session)));

        Ok(id)
    }

    /// Returns the session registered under `id`, if any.
    pub fn get(&self, id: u32) -> Option<Arc<Mutex<S>>> {
        self.inner.lock().unwrap().sessions.get(&id).map(Arc::clone)
    }

    /// Removes and returns the session registered under `id`, if any.
    pub fn remove(&self, id: u32) -> Option<Arc<Mutex<S>>> {
        self.inner.lock().unwrap().sessions.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drains all sessions and puts the table in its terminal state: any
    /// subsequent [`SessionTable::add_with`] fails with `ENODEV`.
    pub fn shutdown(&self) -> Vec<(u32, Arc<Mutex<S>>)> {
        let mut inner = self.inner.lock().unwrap();
        inner.shut_down = true;
        inner.sessions.drain().collect()
    }
}
