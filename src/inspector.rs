//! The command facade the UI talks to.
//!
//! One [`Inspector`] lives for the lifetime of the tool. Attaching builds
//! a fresh per-attach context (process handle, module map, storage);
//! detaching drops it wholesale, so no state survives across attaches.
//! Long walks run on blocking workers and publish progress events;
//! concurrent invocations of the same parser coalesce on its latch.

use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio::task;

use crate::address::Address;
use crate::discovery::Discovery;
use crate::error::{Error, Result};
use crate::events::{CancelToken, Event, EventChannel};
use crate::layout::{SelectedLayout, UeVersion};
use crate::model::{HierarchyNode, ModelBuilder};
use crate::names::{parse_name_pool, NameId};
use crate::objects::{parse_guobject_array, ObjectRecord, PackageIndex};
use crate::pe::PeImage;
use crate::process::{system_processes, MemorySource, Process, ProcessListing};
use crate::query::{
    DetailedObjectInfo, InstanceMatch, InstancePropertySample, ObjectCategory, ObjectSummary,
    PackageSummary, QueryEngine, SearchHit, SearchMode,
};
use crate::storage::Storage;

/// Everything bound to one attach.
struct Target {
    process: Arc<Process>,
    image: PeImage,
    storage: Storage,
    events: EventChannel,
    cancel: Mutex<CancelToken>,
}

impl Target {
    fn cancel_token(&self) -> CancelToken {
        self.cancel.lock().unwrap().clone()
    }
}

/// The stable boundary the UI invokes.
pub struct Inspector {
    target: Mutex<Option<Arc<Target>>>,
}

impl Inspector {
    pub fn new() -> Self {
        Self {
            target: Mutex::new(None),
        }
    }

    /// Lists candidate target processes for the attach dialog.
    pub fn fetch_system_processes(&self) -> Vec<ProcessListing> {
        system_processes()
    }

    /// Attaches to a running process by pid.
    pub async fn attach_to_process(&self, pid: u32, name: &str) -> Result<String> {
        let process = task::spawn_blocking(move || Process::attach(pid))
            .await
            .map_err(|_| Error::Cancelled)??;
        self.install_target(process, name)
    }

    /// Attaches to an already-opened memory source. This is how tests and
    /// alternative backends enter.
    pub fn attach_to_source(&self, source: Box<dyn MemorySource>) -> Result<String> {
        let name = source.process_name().to_owned();
        let process = Process::from_source(source)?;
        self.install_target(process, &name)
    }

    fn install_target(&self, process: Process, name: &str) -> Result<String> {
        let base = process.modules().main_module().base;
        let image = PeImage::read(&process, base)?;
        let pid = process.pid();
        let target = Arc::new(Target {
            process: Arc::new(process),
            image,
            storage: Storage::new(),
            events: EventChannel::new(256),
            cancel: Mutex::new(CancelToken::new()),
        });
        *self.target.lock().unwrap() = Some(target);
        Ok(format!("Attached to {name} (pid {pid})"))
    }

    /// Drops the attach context. Pending parses are cancelled and pending
    /// queries fail.
    pub fn detach(&self) {
        if let Some(target) = self.target.lock().unwrap().take() {
            target.cancel_token().cancel();
        }
    }

    /// Cancels in-flight parsers without detaching. The next command gets
    /// a fresh token.
    pub fn cancel_operations(&self) -> Result<()> {
        let target = self.target()?;
        let mut guard = target.cancel.lock().unwrap();
        guard.cancel();
        *guard = CancelToken::new();
        Ok(())
    }

    /// Subscribes to the progress event channel of the current attach.
    pub fn subscribe_events(&self) -> Result<broadcast::Receiver<Event>> {
        Ok(self.target()?.events.subscribe())
    }

    /// Forwards the UI's informational process-selected broadcast.
    pub fn notify_process_selected(&self, process_name: &str, pid: u32) -> Result<()> {
        self.target()?.events.publish(Event::ProcessSelected {
            process_name: process_name.to_owned(),
            pid,
        });
        Ok(())
    }

    /// A text block describing the attached target's modules.
    pub fn show_base_address(&self) -> Result<String> {
        let target = self.target()?;
        let main = target.process.modules().main_module();
        let mut text = format!(
            "{} base: {} size: {:#x}\n",
            main.name, main.base, main.size
        );
        text.push_str(&format!(
            "{} modules loaded\n",
            target.process.modules().iter().count()
        ));
        Ok(text)
    }

    /// The target's UE major version as a string.
    pub async fn get_ue_version(&self) -> Result<String> {
        let layout = self.ensure_layout().await?;
        Ok(layout.version.major.to_string())
    }

    pub async fn get_fname_pool_address(&self) -> Result<Address> {
        self.ensure_name_pool().await
    }

    pub async fn get_guobject_array_address(&self) -> Result<Address> {
        self.ensure_guobject_array().await
    }

    pub async fn get_gworld_address(&self) -> Result<Address> {
        let target = self.target()?;
        let layout = self.ensure_layout().await?;
        let value = target
            .storage
            .gworld
            .get_or_try_init(|| {
                let target = Arc::clone(&target);
                async move {
                    task::spawn_blocking(move || {
                        let discovery = Discovery {
                            process: &target.process,
                            image: &target.image,
                            profile: layout.profile,
                        };
                        let names = target.storage.names.peek();
                        discovery.locate_gworld(names.as_deref())
                    })
                    .await
                    .map_err(|_| Error::Cancelled)?
                }
            })
            .await?;
        Ok(*value)
    }

    /// Walks the name pool and installs the name table. Returns the name
    /// count. Safe to invoke repeatedly; later calls observe the first
    /// completion.
    pub async fn parse_fname_pool(&self) -> Result<usize> {
        let target = self.target()?;
        let layout = self.ensure_layout().await?;
        let pool = self.ensure_name_pool().await?;
        let names = target
            .storage
            .names
            .get_or_try_init(|| {
                let target = Arc::clone(&target);
                async move {
                    let cancel = target.cancel_token();
                    task::spawn_blocking(move || {
                        let events = &target.events;
                        parse_name_pool(
                            &target.process,
                            layout.profile,
                            pool,
                            &cancel,
                            |event| events.publish(event),
                        )
                    })
                    .await
                    .map_err(|_| Error::Cancelled)?
                }
            })
            .await?;
        Ok(names.len())
    }

    /// Walks the object registry and installs the object table. Parses
    /// the name pool first when that has not happened yet, since
    /// enrichment resolves names.
    pub async fn parse_guobject_array(&self) -> Result<usize> {
        let target = self.target()?;
        let layout = self.ensure_layout().await?;
        self.parse_fname_pool().await?;
        let array = self.ensure_guobject_array().await?;
        let objects = target
            .storage
            .objects
            .get_or_try_init(|| {
                let target = Arc::clone(&target);
                async move {
                    let cancel = target.cancel_token();
                    task::spawn_blocking(move || {
                        let names = target.storage.names.get()?;
                        let events = &target.events;
                        parse_guobject_array(
                            &target.process,
                            layout.profile,
                            array,
                            &names,
                            &cancel,
                            |event| events.publish(event),
                        )
                    })
                    .await
                    .map_err(|_| Error::Cancelled)?
                }
            })
            .await?;
        Ok(objects.len())
    }

    /// Resolves one interned name id.
    pub fn analyze_fname(&self, id: NameId) -> Result<String> {
        let target = self.target()?;
        let names = target.storage.names.get()?;
        names
            .resolve(id)
            .map(str::to_owned)
            .ok_or_else(|| Error::NotFound {
                what: "name",
                key: id.to_string(),
            })
    }

    /// The raw record of the object at an address given in hex.
    pub fn analyze_object(&self, address_hex: &str) -> Result<ObjectRecord> {
        let raw = address_hex.trim();
        let raw = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")).unwrap_or(raw);
        let value = u64::from_str_radix(raw, 16).map_err(|_| Error::NotFound {
            what: "object",
            key: address_hex.to_owned(),
        })?;
        let target = self.target()?;
        let objects = target.storage.objects.get()?;
        objects
            .by_address(Address::new(value))
            .cloned()
            .ok_or_else(|| Error::NotFound {
                what: "object",
                key: address_hex.to_owned(),
            })
    }

    pub async fn get_packages(&self) -> Result<Vec<PackageSummary>> {
        self.with_engine(move |engine| Ok(engine.list_packages())).await
    }

    pub async fn get_objects(
        &self,
        package: String,
        category: ObjectCategory,
    ) -> Result<Vec<ObjectSummary>> {
        self.with_engine(move |engine| engine.list_objects(&package, category))
            .await
    }

    pub async fn global_search(
        &self,
        query: String,
        mode: SearchMode,
    ) -> Result<Vec<SearchHit>> {
        self.with_engine(move |engine| Ok(engine.global_search(&query, mode)))
            .await
    }

    pub async fn get_object_details(&self, address: u64) -> Result<DetailedObjectInfo> {
        self.with_engine(move |engine| engine.get_object_details(Address::new(address)))
            .await
    }

    pub async fn add_inspector(&self, instance_address: u64) -> Result<Vec<HierarchyNode>> {
        self.with_engine(move |engine| engine.add_inspector(Address::new(instance_address)))
            .await
    }

    pub async fn get_instance_details(
        &self,
        instance_address: u64,
        class_address: u64,
    ) -> Result<Vec<InstancePropertySample>> {
        self.with_engine(move |engine| {
            engine.get_instance_details(Address::new(instance_address), Address::new(class_address))
        })
        .await
    }

    pub async fn get_array_elements(
        &self,
        array_address: u64,
        inner_type: String,
        count: u32,
    ) -> Result<Vec<InstancePropertySample>> {
        self.with_engine(move |engine| {
            engine.get_array_elements(Address::new(array_address), &inner_type, count)
        })
        .await
    }

    pub async fn search_object_instances(
        &self,
        class_address: u64,
    ) -> Result<Vec<InstanceMatch>> {
        self.with_engine(move |engine| engine.search_object_instances(Address::new(class_address)))
            .await
    }

    fn target(&self) -> Result<Arc<Target>> {
        self.target
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::NotAttached)
    }

    async fn ensure_layout(&self) -> Result<SelectedLayout> {
        let target = self.target()?;
        let layout = target
            .storage
            .layout
            .get_or_try_init(|| async {
                let main = target.process.modules().main_module().name.clone();
                match target.process.file_version(&main) {
                    Some(file) => Ok(SelectedLayout::for_version(UeVersion::from_file_version(
                        file,
                    ))),
                    None => Err(Error::UnsupportedVersion { major: 0 }),
                }
            })
            .await?;
        Ok(*layout)
    }

    async fn ensure_name_pool(&self) -> Result<Address> {
        let target = self.target()?;
        let layout = self.ensure_layout().await?;
        let value = target
            .storage
            .name_pool
            .get_or_try_init(|| {
                let target = Arc::clone(&target);
                async move {
                    task::spawn_blocking(move || {
                        let discovery = Discovery {
                            process: &target.process,
                            image: &target.image,
                            profile: layout.profile,
                        };
                        discovery.locate_name_pool()
                    })
                    .await
                    .map_err(|_| Error::Cancelled)?
                }
            })
            .await?;
        Ok(*value)
    }

    async fn ensure_guobject_array(&self) -> Result<Address> {
        let target = self.target()?;
        let layout = self.ensure_layout().await?;
        let value = target
            .storage
            .guobject_array
            .get_or_try_init(|| {
                let target = Arc::clone(&target);
                async move {
                    task::spawn_blocking(move || {
                        let discovery = Discovery {
                            process: &target.process,
                            image: &target.image,
                            profile: layout.profile,
                        };
                        let pool = target.storage.name_pool.peek().map(|p| *p);
                        discovery.locate_guobject_array(pool)
                    })
                    .await
                    .map_err(|_| Error::Cancelled)?
                }
            })
            .await?;
        Ok(*value)
    }

    /// Runs a query closure on a blocking worker with the full engine in
    /// scope. Queries fail fast with `NotReady` when the parsers have not
    /// populated storage yet.
    async fn with_engine<R, F>(&self, run: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&QueryEngine<'_>) -> Result<R> + Send + 'static,
    {
        let target = self.target()?;
        let layout = *target.storage.layout.get()?;
        let names = target.storage.names.get()?;
        let objects = target.storage.objects.get()?;
        let packages = target
            .storage
            .packages
            .get_or_try_init(|| async { Ok(PackageIndex::build(&objects)) })
            .await?;

        task::spawn_blocking(move || {
            let engine = QueryEngine {
                builder: ModelBuilder {
                    process: &target.process,
                    profile: layout.profile,
                    names: &names,
                    objects: &objects,
                    module_base: target.image.base,
                },
                packages: &packages,
            };
            run(&engine)
        })
        .await
        .map_err(|_| Error::Cancelled)?
    }
}

impl Default for Inspector {
    fn default() -> Self {
        Self::new()
    }
}
