// Node-wide leader election between the powmon instances, over SysV shared memory.
//
// The first instance that creates the segment of the election key is the leader.
// `shmget(IPC_CREAT | IPC_EXCL)` is atomic, so at most one creation succeeds;
// every other instance attaches to the existing segment and becomes a follower.
// The leader signals the completion of its session in the segment, then removes it.
//
// A killed leader leaves the segment behind: the followers of the next runs then
// wait forever. `cleanup` removes such a stale segment and must be invoked explicitly.

use std::{
    io,
    mem,
    ptr::NonNull,
    sync::atomic::{AtomicI32, AtomicU32, Ordering},
    thread,
    time::{Duration, Instant},
};

use log::{debug, info, warn};

use crate::error::ElectionError;

/// Written by the leader once the other fields are initialized.
const READY_MAGIC: u32 = 0x706f_776d;
const POLL_INTERVAL: Duration = Duration::from_millis(10);
const LIVENESS_CHECK_INTERVAL: Duration = Duration::from_secs(1);
const SEGMENT_MODE: libc::c_int = 0o600;

/// Content of the shared segment. The kernel fills a new segment with zeros.
#[repr(C)]
struct ElectionBlock {
    ready: AtomicU32,
    leader_pid: AtomicI32,
    observers: AtomicU32,
    completed: AtomicU32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
}

/// Membership of this process in the election of a key.
///
/// Dropping it detaches the segment. For the leader, it also signals the
/// completion and removes the segment, so that the error paths don't leave stale state.
pub struct Election {
    key: libc::key_t,
    shmid: libc::c_int,
    block: NonNull<ElectionBlock>,
    role: Role,
    released: bool,
}

/// Joins the election of `key`.
pub fn acquire(key: libc::key_t) -> Result<Election, ElectionError> {
    let size = mem::size_of::<ElectionBlock>();
    loop {
        let created = unsafe { libc::shmget(key, size, libc::IPC_CREAT | libc::IPC_EXCL | SEGMENT_MODE) };
        if created >= 0 {
            return lead(key, created, attach(key, created));
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EEXIST) {
            return Err(ElectionError::Create { key, source: err });
        }

        let existing = unsafe { libc::shmget(key, size, SEGMENT_MODE) };
        if existing < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOENT) {
                // removed by its leader between the two calls
                debug!("segment {key:#x} vanished, retrying the election");
                continue;
            }
            return Err(ElectionError::Attach { key, source: err });
        }
        match follow(key, existing)? {
            Some(election) => return Ok(election),
            None => {
                debug!("segment {key:#x} vanished or completed, retrying the election");
                thread::sleep(POLL_INTERVAL);
            }
        }
    }
}

/// Initializes the segment that this process has just created.
/// The segment is removed if it could not be attached.
fn lead(
    key: libc::key_t,
    shmid: libc::c_int,
    attached: Result<NonNull<ElectionBlock>, ElectionError>,
) -> Result<Election, ElectionError> {
    let block = match attached {
        Ok(block) => block,
        Err(e) => {
            if let Err(removal) = remove(key, shmid) {
                warn!("{removal}");
            }
            return Err(e);
        }
    };
    let election = Election {
        key,
        shmid,
        block,
        role: Role::Leader,
        released: false,
    };
    let b = election.block();
    b.leader_pid.store(unsafe { libc::getpid() }, Ordering::Relaxed);
    b.observers.store(0, Ordering::Relaxed);
    b.completed.store(0, Ordering::Relaxed);
    b.ready.store(READY_MAGIC, Ordering::Release);
    info!("elected leader for key {key:#x}");
    Ok(election)
}

/// Attaches to the segment of another leader. Returns `None` if the segment
/// has been removed in the meantime, or belongs to a session that is already over.
fn follow(key: libc::key_t, shmid: libc::c_int) -> Result<Option<Election>, ElectionError> {
    let block = match attach(key, shmid) {
        Ok(block) => block,
        Err(ElectionError::Attach { source, .. })
            if matches!(source.raw_os_error(), Some(libc::EIDRM | libc::EINVAL)) =>
        {
            return Ok(None)
        }
        Err(e) => return Err(e),
    };
    let mut election = Election {
        key,
        shmid,
        block,
        role: Role::Follower,
        released: false,
    };
    election.wait_until(|b| b.ready.load(Ordering::Acquire) == READY_MAGIC);
    if election.block().completed.load(Ordering::Acquire) != 0 {
        // not counted as an observer, only detach
        election.released = true;
        unsafe { libc::shmdt(block.as_ptr() as *const libc::c_void) };
        return Ok(None);
    }
    election.block().observers.fetch_add(1, Ordering::AcqRel);
    info!(
        "following leader {} for key {key:#x}",
        election.block().leader_pid.load(Ordering::Relaxed)
    );
    Ok(Some(election))
}

/// Removes the segment of `key`, if any. Returns `true` if a segment was removed.
pub fn cleanup(key: libc::key_t) -> Result<bool, ElectionError> {
    let shmid = unsafe { libc::shmget(key, 0, 0) };
    if shmid < 0 {
        let err = io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(libc::ENOENT) => Ok(false),
            _ => Err(ElectionError::Attach { key, source: err }),
        };
    }
    remove(key, shmid)?;
    info!("removed stale segment {key:#x}");
    Ok(true)
}

fn attach(key: libc::key_t, shmid: libc::c_int) -> Result<NonNull<ElectionBlock>, ElectionError> {
    let addr = unsafe { libc::shmat(shmid, std::ptr::null(), 0) };
    if addr as isize == -1 {
        return Err(ElectionError::Attach {
            key,
            source: io::Error::last_os_error(),
        });
    }
    NonNull::new(addr as *mut ElectionBlock).ok_or(ElectionError::Attach {
        key,
        source: io::Error::from(io::ErrorKind::InvalidData),
    })
}

fn remove(key: libc::key_t, shmid: libc::c_int) -> Result<(), ElectionError> {
    let result = unsafe { libc::shmctl(shmid, libc::IPC_RMID, std::ptr::null_mut()) };
    if result < 0 {
        let err = io::Error::last_os_error();
        // already removed by someone else
        if err.raw_os_error() != Some(libc::EINVAL) {
            return Err(ElectionError::Remove { key, source: err });
        }
    }
    Ok(())
}

fn is_alive(pid: libc::pid_t) -> bool {
    let result = unsafe { libc::kill(pid, 0) };
    result == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

impl Election {
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn observers(&self) -> u32 {
        self.block().observers.load(Ordering::Acquire)
    }

    fn block(&self) -> &ElectionBlock {
        // SAFETY: the segment stays mapped until `self` is dropped, and is only accessed through atomics
        unsafe { self.block.as_ref() }
    }

    /// Polls the segment until `done`. Warns once if the leader has disappeared
    /// or never initialized the segment.
    fn wait_until(&self, done: impl Fn(&ElectionBlock) -> bool) {
        let mut last_check = Instant::now();
        let mut warned = false;
        while !done(self.block()) {
            if !warned && last_check.elapsed() >= LIVENESS_CHECK_INTERVAL {
                last_check = Instant::now();
                let pid = self.block().leader_pid.load(Ordering::Relaxed);
                if pid <= 0 {
                    warn!("segment {:#x} has no leader, run `powmon -c` to remove the stale segment", self.key);
                    warned = true;
                } else if !is_alive(pid) {
                    warn!("leader {pid} of key {:#x} is gone, run `powmon -c` to remove the stale segment", self.key);
                    warned = true;
                }
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Blocks a follower until the leader signals the completion of its session.
    /// Returns immediately for the leader.
    pub fn wait_for_leader(&self) {
        if self.role == Role::Follower {
            self.wait_until(|b| b.completed.load(Ordering::Acquire) != 0);
            debug!("leader of {:#x} has completed", self.key);
        }
    }

    /// Tells the followers that the measurements are finished.
    pub fn signal_completion(&self) {
        if self.role == Role::Leader {
            self.block().completed.store(1, Ordering::Release);
        }
    }

    /// Ends the participation to the election. The leader signals the completion
    /// (if not done yet) and removes the segment.
    pub fn release(mut self) -> Result<(), ElectionError> {
        self.released = true;
        self.teardown()
    }

    fn teardown(&mut self) -> Result<(), ElectionError> {
        let removed = match self.role {
            Role::Leader => {
                self.signal_completion();
                remove(self.key, self.shmid)
            }
            Role::Follower => {
                self.block().observers.fetch_sub(1, Ordering::AcqRel);
                Ok(())
            }
        };
        unsafe { libc::shmdt(self.block.as_ptr() as *const libc::c_void) };
        removed
    }
}

impl Drop for Election {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            if let Err(e) = self.teardown() {
                warn!("{e}");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    static NEXT: AtomicI32 = AtomicI32::new(0);

    /// A key that no other test (or test process) uses.
    pub(crate) fn unique_key() -> libc::key_t {
        let pid = std::process::id() as i32 & 0xFFFF;
        0x5000_0000 | (pid << 8) | NEXT.fetch_add(1, Ordering::Relaxed)
    }

    #[test]
    fn test_first_is_leader_others_follow() {
        let key = unique_key();
        let leader = acquire(key).unwrap();
        assert_eq!(leader.role(), Role::Leader);

        let follower = acquire(key).unwrap();
        assert_eq!(follower.role(), Role::Follower);
        assert_eq!(leader.observers(), 1);
        drop(follower);
        assert_eq!(leader.observers(), 0);

        leader.release().unwrap();
        assert!(!cleanup(key).unwrap());
    }

    #[test]
    fn test_follower_waits_for_completion() {
        let key = unique_key();
        let leader = acquire(key).unwrap();
        let waiter = thread::spawn(move || {
            let follower = acquire(key).unwrap();
            let start = Instant::now();
            follower.wait_for_leader();
            start.elapsed()
        });
        thread::sleep(Duration::from_millis(200));
        leader.release().unwrap();
        let waited = waiter.join().unwrap();
        assert!(waited >= Duration::from_millis(100), "{waited:?}");
    }

    #[test]
    fn test_dropped_leader_removes_the_segment() {
        let key = unique_key();
        drop(acquire(key).unwrap());
        assert_eq!(acquire(key).unwrap().role(), Role::Leader);
        assert!(!cleanup(key).unwrap());
    }

    fn create_segment(key: libc::key_t) -> libc::c_int {
        let size = mem::size_of::<ElectionBlock>();
        let shmid = unsafe { libc::shmget(key, size, libc::IPC_CREAT | libc::IPC_EXCL | SEGMENT_MODE) };
        assert!(shmid >= 0, "{}", io::Error::last_os_error());
        shmid
    }

    #[test]
    fn test_failed_leader_attach_removes_the_segment() {
        let key = unique_key();
        let shmid = create_segment(key);
        let attached = Err(ElectionError::Attach {
            key,
            source: io::Error::from_raw_os_error(libc::ENOMEM),
        });
        assert!(matches!(lead(key, shmid, attached), Err(ElectionError::Attach { .. })));

        // no uninitialized segment is left for the next instances
        assert!(!cleanup(key).unwrap());
        assert_eq!(acquire(key).unwrap().role(), Role::Leader);
    }

    #[test]
    fn test_follow_removed_segment_retries() {
        let key = unique_key();
        let shmid = create_segment(key);
        remove(key, shmid).unwrap();
        assert!(follow(key, shmid).unwrap().is_none());
        assert_eq!(acquire(key).unwrap().role(), Role::Leader);
    }

    #[test]
    fn test_follow_completed_session_retries() {
        let key = unique_key();
        let leader = acquire(key).unwrap();
        leader.signal_completion();
        assert!(follow(key, leader.shmid).unwrap().is_none());
        assert_eq!(leader.observers(), 0);
        leader.release().unwrap();
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let key = unique_key();
        assert!(!cleanup(key).unwrap());

        let stale = acquire(key).unwrap();
        // simulate a killed leader: the segment is left behind
        mem::forget(stale);
        assert!(cleanup(key).unwrap());
        assert!(!cleanup(key).unwrap());
        assert_eq!(acquire(key).unwrap().role(), Role::Leader);
    }
}
