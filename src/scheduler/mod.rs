//! Library manager: owns the drives and the robot, allocates drives to
//! filesystem workers and runs background trims.

pub mod discovery;
mod handlers;
mod mapping;
mod positioning;
pub mod request;

pub use handlers::pick_write_tape;
pub use positioning::MAX_WRITE_RETRIES;
pub use request::{AllocationRequest, RequestKind, RequestTable, REQUEST_TIMEOUT_TICKS, TICK};

use crate::catalog::MetadataStore;
use crate::command::CommandRunner;
use crate::config::Config;
use crate::device::DeviceIo;
use crate::drive::Drive;
use crate::error::{Result, TlfsError};
use crate::robot::LibraryRobot;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Instant;
use tracing::{debug, error, info, warn};

pub struct LibraryManager {
    store: Arc<dyn MetadataStore>,
    robot: LibraryRobot,
    drives: Vec<Arc<Drive>>,
    block_size: usize,
    requests: Mutex<RequestTable<ThreadId>>,
    request_fulfilled: Condvar,
    trims: Mutex<Vec<u32>>,
    mounted: AtomicBool,
    mapping_complete: AtomicBool,
    fatal: Mutex<Option<String>>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    last_tick: Mutex<Instant>,
}

impl LibraryManager {
    /// Reconciles the catalog, discovers devices and tapes, and trims every tape.
    ///
    /// Any device command failure here aborts the mount.
    pub fn start(
        store: Arc<dyn MetadataStore>,
        runner: Arc<dyn CommandRunner>,
        devices: Arc<dyn DeviceIo>,
        config: &Config,
    ) -> Result<Arc<Self>> {
        let reclaimed = store.delete_incomplete_files_and_parts()?;
        if reclaimed > 0 {
            warn!(
                "Removed {} files left incomplete by an unclean shutdown",
                reclaimed
            );
        }

        let listing = runner.run(&config.tools.lsscsi, &["--generic"])?;
        let found = discovery::parse_lsscsi(&listing);

        let changer = config
            .changer_path
            .clone()
            .or(found.changer)
            .ok_or_else(|| {
                TlfsError::config(
                    "no medium changer found; check `lsscsi --generic` or set changer_path",
                )
            })?;

        let selected: Vec<discovery::DiscoveredDrive> = if config.drive_paths.is_empty() {
            found.drives
        } else {
            config
                .drive_paths
                .iter()
                .map(|path| {
                    found
                        .drives
                        .iter()
                        .find(|d| &d.device_path == path)
                        .cloned()
                        .unwrap_or_else(|| {
                            warn!("Configured drive {} was not discovered", path);
                            discovery::DiscoveredDrive {
                                device_path: path.clone(),
                                generic_path: None,
                            }
                        })
                })
                .collect()
        };
        if selected.is_empty() {
            return Err(TlfsError::config(
                "no tape drives found; check `lsscsi --generic` or set drive_paths",
            ));
        }

        let drives: Vec<Arc<Drive>> = selected
            .into_iter()
            .map(|d| {
                Arc::new(Drive::new(
                    &d.device_path,
                    d.generic_path,
                    &config.tools.mt,
                    config.block_size,
                    runner.clone(),
                    devices.clone(),
                ))
            })
            .collect();
        for drive in &drives {
            drive.refresh_status()?;
            debug!(
                "Found drive {} (generic {})",
                drive.device_path(),
                drive.generic_path().unwrap_or("-")
            );
        }

        let robot = LibraryRobot::new(&changer, &config.tools.mtx, runner);
        let status = robot.refresh_status()?;
        info!(
            "Changer {}: {} drive slots, {} storage slots",
            robot.changer_path(),
            status.drive_slots.len(),
            status.storage_slots.len()
        );
        discovery::register_new_tapes(store.as_ref(), &status)?;

        for tape in store.list_tapes()? {
            store.clear_deleted_parts_from_end_of_tape(tape.id)?;
        }

        let (wake_tx, wake_rx) = channel::bounded(1);
        Ok(Arc::new(Self {
            store,
            robot,
            drives,
            block_size: config.block_size,
            requests: Mutex::new(RequestTable::default()),
            request_fulfilled: Condvar::new(),
            trims: Mutex::new(Vec::new()),
            mounted: AtomicBool::new(true),
            mapping_complete: AtomicBool::new(false),
            fatal: Mutex::new(None),
            wake_tx,
            wake_rx,
            last_tick: Mutex::new(Instant::now()),
        }))
    }

    /// Starts the background loop (and, from it, the drive mapper).
    pub fn spawn(self: &Arc<Self>) -> Result<JoinHandle<Result<()>>> {
        let this = self.clone();
        let handle = thread::Builder::new()
            .name("tlfs-scheduler".to_string())
            .spawn(move || this.run())?;
        Ok(handle)
    }

    fn run(self: Arc<Self>) -> Result<()> {
        let mapper = {
            let this = self.clone();
            thread::Builder::new()
                .name("tlfs-mapper".to_string())
                .spawn(move || {
                    if let Err(e) = this.map_drives() {
                        this.fail(format!("drive mapping failed: {}", e));
                    }
                })?
        };

        info!("Scheduler running with {} drives", self.drives.len());
        while self.is_mounted() {
            let _ = self.wake_rx.recv_timeout(TICK);
            if !self.is_mounted() {
                break;
            }
            if let Err(e) = self.run_once() {
                error!("Scheduler failed, unmounting: {}", e);
                self.fail(e.to_string());
            }
        }

        if mapper.join().is_err() {
            error!("Drive mapper panicked");
        }
        self.requests.lock().clear();
        self.request_fulfilled.notify_all();
        info!("Scheduler stopped");

        match self.fatal_error() {
            Some(reason) => Err(TlfsError::Generic(anyhow::anyhow!(reason))),
            None => Ok(()),
        }
    }

    fn run_once(&self) -> Result<()> {
        self.process_trims()?;
        self.service_next_request()?;

        let due = {
            let mut last = self.last_tick.lock();
            if last.elapsed() >= TICK {
                *last = Instant::now();
                true
            } else {
                false
            }
        };
        if due {
            self.expire_requests();
        }
        Ok(())
    }

    fn process_trims(&self) -> Result<()> {
        let queued = std::mem::take(&mut *self.trims.lock());
        if queued.is_empty() {
            return Ok(());
        }

        let mut deferred = Vec::new();
        for tape_id in queued {
            if self.tape_in_busy_drive(tape_id)? {
                deferred.push(tape_id);
                continue;
            }
            let removed = self.store.clear_deleted_parts_from_end_of_tape(tape_id)?;
            if removed > 0 {
                debug!("Trim removed {} parts from tape #{}", removed, tape_id);
            }
        }

        if !deferred.is_empty() {
            let mut trims = self.trims.lock();
            for tape_id in deferred {
                if !trims.contains(&tape_id) {
                    trims.push(tape_id);
                }
            }
        }
        Ok(())
    }

    /// Services the highest-priority request that can make progress this tick.
    fn service_next_request(&self) -> Result<()> {
        let pending = self.requests.lock().pending();
        for (key, request) in pending {
            let resolution = self.handle_request(&request)?;
            let drive = match resolution {
                handlers::Resolution::Deferred => continue,
                handlers::Resolution::Fulfilled(drive) => {
                    debug!(
                        "{:?} request #{} fulfilled with {}",
                        request.kind,
                        request.seq,
                        drive.describe()
                    );
                    Some(drive)
                }
                handlers::Resolution::Failed(reason) => {
                    error!("{:?} request #{} failed: {}", request.kind, request.seq, reason);
                    None
                }
            };

            self.deliver(key, &request, drive);
            return Ok(());
        }
        Ok(())
    }

    /// Hands the outcome to the waiting worker. A new-* drive whose worker
    /// has gone is returned to the idle pool.
    fn deliver(&self, key: ThreadId, request: &AllocationRequest, drive: Option<Arc<Drive>>) {
        let delivered = self.requests.lock().fulfil(key, request.seq, drive.clone());
        if !delivered && !request.kind.is_continuation() {
            if let Some(drive) = drive {
                debug!("Request #{} was abandoned, freeing {}", request.seq, drive.device_path());
                drive.set_busy(false);
            }
        }
        self.request_fulfilled.notify_all();
    }

    fn expire_requests(&self) {
        let expired = self.requests.lock().tick();
        for request in expired {
            warn!(
                "{:?} request #{} timed out without a refresh",
                request.kind, request.seq
            );
            if request.fulfilled && !request.kind.is_continuation() {
                if let Some(drive) = request.drive {
                    drive.set_busy(false);
                }
            }
        }
    }

    fn tape_in_busy_drive(&self, tape_id: u32) -> Result<bool> {
        let Some(tape) = self.store.get_tape(tape_id)? else {
            return Ok(false);
        };
        Ok(self
            .drives
            .iter()
            .any(|d| d.is_busy() && d.barcode().as_deref() == Some(tape.barcode.as_str())))
    }

    /// Registers a request for the calling worker and blocks until it is served.
    pub(crate) fn submit_and_wait(
        &self,
        kind: RequestKind,
        tape_id: Option<u32>,
        drive: Option<Arc<Drive>>,
    ) -> Result<Arc<Drive>> {
        let key = thread::current().id();
        let started = Instant::now();
        let mut requests = self.requests.lock();
        let mut seq = requests.submit(key, kind, tape_id, drive.clone());
        self.wake();
        debug!("Submitted {:?} request #{}", kind, seq);

        loop {
            if !self.is_mounted() {
                requests.remove(key);
                return Err(TlfsError::Unmounted);
            }
            if let Some(request) = requests.take_fulfilled(key) {
                debug!(
                    "{:?} request #{} served after {}",
                    kind,
                    request.seq,
                    crate::utils::format_duration(started.elapsed())
                );
                return request.drive.ok_or_else(|| {
                    TlfsError::drive_load(format!("{:?} request #{} served without a drive", kind, seq))
                });
            }
            if !requests.refresh(key) {
                seq = requests.submit(key, kind, tape_id, drive.clone());
                self.wake();
                debug!("Resubmitted {:?} request as #{}", kind, seq);
            }
            self.request_fulfilled.wait_for(&mut requests, TICK);
        }
    }

    /// Returns a drive to the idle pool once its open file is released.
    pub fn release_drive(&self, drive: &Drive) {
        drive.set_busy(false);
        debug!("Released {}", drive.describe());
        self.wake();
    }

    /// Queues a background trim of a tape. Does not wait.
    pub fn trim_tape(&self, tape_id: u32) {
        {
            let mut trims = self.trims.lock();
            if !trims.contains(&tape_id) {
                trims.push(tape_id);
            }
        }
        self.wake();
    }

    fn wake(&self) {
        let _ = self.wake_tx.try_send(());
    }

    /// Stops the loop and the mapper at their next iteration; waiting workers fail.
    pub fn request_stop(&self) {
        if self.mounted.swap(false, Ordering::SeqCst) {
            info!("Unmount requested");
        }
        self.wake();
        self.request_fulfilled.notify_all();
    }

    fn fail(&self, reason: String) {
        {
            let mut fatal = self.fatal.lock();
            if fatal.is_none() {
                *fatal = Some(reason);
            }
        }
        self.request_stop();
    }

    pub fn fatal_error(&self) -> Option<String> {
        self.fatal.lock().clone()
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
    }

    pub fn is_mapping_complete(&self) -> bool {
        self.mapping_complete.load(Ordering::SeqCst)
    }

    pub fn drives(&self) -> &[Arc<Drive>] {
        &self.drives
    }

    pub fn robot(&self) -> &LibraryRobot {
        &self.robot
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::testing::SimulatedLibrary;
    use std::time::Duration;

    fn config(block_size: usize) -> Config {
        Config {
            mountpoint: "/mnt/tape".into(),
            block_size,
            ..Config::default()
        }
    }

    fn start(sim: &SimulatedLibrary, store: Arc<Catalog>) -> Arc<LibraryManager> {
        LibraryManager::start(store, Arc::new(sim.clone()), Arc::new(sim.clone()), &config(64))
            .unwrap()
    }

    fn wait_for_mapping(manager: &LibraryManager) {
        for _ in 0..100 {
            if manager.is_mapping_complete() {
                return;
            }
            thread::sleep(Duration::from_millis(20));
        }
        panic!("drive mapping did not complete");
    }

    #[test]
    fn test_start_discovers_devices_and_tapes() {
        let sim = SimulatedLibrary::new(2, 4)
            .with_tape(1, "000001L8", 100)
            .with_tape(2, "000002M8", 100)
            .with_tape(3, "CLN001L1", 100);
        let store = Arc::new(Catalog::in_memory());
        let manager = start(&sim, store.clone());

        assert_eq!(manager.drives().len(), 2);
        assert_eq!(manager.drives()[0].device_path(), "/dev/nst0");
        assert!(manager.drives().iter().all(|d| d.is_busy()));
        assert_eq!(store.list_tapes().unwrap().len(), 2);
        assert_eq!(manager.robot().changer_path(), "/dev/sg9");
    }

    #[test]
    fn test_configured_drive_subset() {
        let sim = SimulatedLibrary::new(2, 2);
        let config = Config {
            drive_paths: vec!["/dev/nst1".into()],
            ..config(64)
        };
        let manager = LibraryManager::start(
            Arc::new(Catalog::in_memory()),
            Arc::new(sim.clone()),
            Arc::new(sim.clone()),
            &config,
        )
        .unwrap();
        assert_eq!(manager.drives().len(), 1);
        assert_eq!(manager.drives()[0].device_path(), "/dev/nst1");
        assert_eq!(manager.drives()[0].generic_path(), Some("/dev/sg1"));
    }

    #[test]
    fn test_mapping_finds_reversed_slots() {
        let sim = SimulatedLibrary::new(2, 4)
            .with_tape(1, "000001L8", 100)
            .with_tape(2, "000002L8", 100);
        let manager = start(&sim, Arc::new(Catalog::in_memory()));
        let scheduler = manager.spawn().unwrap();
        wait_for_mapping(&manager);

        // the simulator wires /dev/nstN to element drives-1-N
        assert_eq!(manager.drives()[0].slot(), Some(1));
        assert_eq!(manager.drives()[1].slot(), Some(0));
        assert!(manager.drives().iter().all(|d| d.is_idle() && d.has_tape()));

        manager.request_stop();
        scheduler.join().unwrap().unwrap();
    }

    /// A manager whose single drive is mapped and idle, with the loop stopped
    /// so the test can step it by hand.
    fn mapped_and_stopped() -> Arc<LibraryManager> {
        let sim = SimulatedLibrary::new(1, 2).with_tape(1, "000001L8", 100);
        let manager = start(&sim, Arc::new(Catalog::in_memory()));
        let scheduler = manager.spawn().unwrap();
        wait_for_mapping(&manager);
        manager.request_stop();
        scheduler.join().unwrap().unwrap();
        assert!(manager.drives()[0].is_idle());
        manager
    }

    #[test]
    fn test_expired_fulfilled_request_frees_its_drive() {
        let manager = mapped_and_stopped();
        let drive = manager.drives()[0].clone();
        let key = thread::current().id();

        manager.requests.lock().submit(key, RequestKind::NewWrite, None, None);
        manager.service_next_request().unwrap();
        assert!(drive.is_busy());
        assert!(manager.requests.lock().pending().is_empty());

        // the worker never takes the drive
        for _ in 0..REQUEST_TIMEOUT_TICKS {
            manager.expire_requests();
        }
        assert!(manager.requests.lock().is_empty());
        assert!(drive.is_idle());
    }

    #[test]
    fn test_abandoned_request_frees_its_drive() {
        let manager = mapped_and_stopped();
        let drive = manager.drives()[0].clone();
        let key = thread::current().id();

        let stale = {
            let mut requests = manager.requests.lock();
            requests.submit(key, RequestKind::NewRead, Some(1), None);
            let (_, stale) = requests.pending().remove(0);
            // the worker resubmits before the stale request is served
            requests.submit(key, RequestKind::NewRead, Some(1), None);
            stale
        };
        drive.set_busy(true);
        manager.deliver(key, &stale, Some(drive.clone()));

        assert!(drive.is_idle());
        assert_eq!(manager.requests.lock().pending().len(), 1);
    }

    #[test]
    fn test_abandoned_continuation_keeps_its_drive() {
        let manager = mapped_and_stopped();
        let drive = manager.drives()[0].clone();
        let key = thread::current().id();

        let stale = {
            let mut requests = manager.requests.lock();
            requests.submit(key, RequestKind::ContinueWrite, None, Some(drive.clone()));
            let (_, stale) = requests.pending().remove(0);
            requests.remove(key);
            stale
        };
        drive.set_busy(true);
        manager.deliver(key, &stale, Some(drive.clone()));
        assert!(drive.is_busy());
    }

    #[test]
    fn test_stop_fails_waiting_workers() {
        let sim = SimulatedLibrary::new(1, 2);
        let manager = start(&sim, Arc::new(Catalog::in_memory()));
        let scheduler = manager.spawn().unwrap();

        let waiter = {
            let manager = manager.clone();
            thread::spawn(move || manager.submit_and_wait(RequestKind::NewWrite, None, None))
        };
        thread::sleep(Duration::from_millis(300));
        manager.request_stop();

        assert!(matches!(waiter.join().unwrap(), Err(TlfsError::Unmounted)));
        scheduler.join().unwrap().unwrap();
    }

    #[test]
    fn test_trims_are_deduplicated() {
        let sim = SimulatedLibrary::new(1, 2).with_tape(1, "000001L8", 100);
        let manager = start(&sim, Arc::new(Catalog::in_memory()));
        manager.trim_tape(1);
        manager.trim_tape(1);
        assert_eq!(manager.trims.lock().len(), 1);
        manager.process_trims().unwrap();
        assert!(manager.trims.lock().is_empty());
    }

    #[test]
    fn test_missing_changer_aborts_start() {
        struct NoChanger(SimulatedLibrary);
        impl CommandRunner for NoChanger {
            fn run(&self, program: &str, args: &[&str]) -> Result<String> {
                let out = self.0.run(program, args)?;
                Ok(out.lines().filter(|l| !l.contains("mediumx")).collect::<Vec<_>>().join("\n"))
            }
        }
        let sim = SimulatedLibrary::new(1, 1);
        let err = LibraryManager::start(
            Arc::new(Catalog::in_memory()),
            Arc::new(NoChanger(sim.clone())),
            Arc::new(sim),
            &config(64),
        )
        .err()
        .unwrap();
        assert!(matches!(err, TlfsError::Config(_)));
    }
}
