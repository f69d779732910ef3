//! Write-once storage for everything parsed out of the target.
//!
//! Each artifact sits behind a [`Latch`]: an install publishes the value
//! once, readers afterwards see the immutable snapshot without taking a
//! lock. A second writer loses. Parsers coalesce through
//! [`Latch::get_or_try_init`], so concurrent invocations of the same
//! parser observe a single completion.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::OnceCell;

use crate::address::Address;
use crate::error::{Error, Result};
use crate::layout::SelectedLayout;
use crate::names::NameTable;
use crate::objects::{ObjectTable, PackageIndex};

/// A write-once slot protecting one parsed artifact.
pub struct Latch<T> {
    cell: OnceCell<Arc<T>>,
    component: &'static str,
}

impl<T> Latch<T> {
    pub fn new(component: &'static str) -> Self {
        Self {
            cell: OnceCell::new(),
            component,
        }
    }

    /// The latch's component name, used in `NotReady` errors.
    pub fn component(&self) -> &'static str {
        self.component
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.initialized()
    }

    /// The installed value, or `None` when not yet initialized.
    pub fn peek(&self) -> Option<Arc<T>> {
        self.cell.get().cloned()
    }

    /// The installed value; fails fast with `NotReady` when absent.
    pub fn get(&self) -> Result<Arc<T>> {
        self.peek().ok_or(Error::NotReady {
            component: self.component,
        })
    }

    /// Installs a value. Fails if the latch was already initialized.
    pub fn set(&self, value: T) -> Result<()> {
        self.cell
            .set(Arc::new(value))
            .map_err(|_| Error::CorruptLayout {
                location: "latch double-set",
            })
    }

    /// Returns the installed value, running `init` to produce it if the
    /// latch is empty. Concurrent callers coalesce on one `init`; a
    /// failed or cancelled `init` leaves the latch empty.
    pub async fn get_or_try_init<F, Fut>(&self, init: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.cell
            .get_or_try_init(|| async { init().await.map(Arc::new) })
            .await
            .cloned()
    }
}

/// Per-attach storage: every latch the discovery and parsing layers can
/// install. Dropped wholesale on detach; nothing survives re-attach.
pub struct Storage {
    pub layout: Latch<SelectedLayout>,
    pub name_pool: Latch<Address>,
    pub guobject_array: Latch<Address>,
    pub gworld: Latch<Address>,
    pub names: Latch<NameTable>,
    pub objects: Latch<ObjectTable>,
    pub packages: Latch<PackageIndex>,
}

impl Storage {
    pub fn new() -> Self {
        Self {
            layout: Latch::new("version"),
            name_pool: Latch::new("NamePool"),
            guobject_array: Latch::new("GUObjectArray"),
            gworld: Latch::new("GWorld"),
            names: Latch::new("name table"),
            objects: Latch::new("object table"),
            packages: Latch::new("package index"),
        }
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self::new()
    }
}
