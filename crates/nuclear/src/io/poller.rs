use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use bitflags::bitflags;

use crate::reaction::Reaction;
use crate::scheduler::Scheduler;

bitflags! {
    /// The interest/event bitset from §3's I/O Entry.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct Interest: u32 {
        const READ = 0b0001;
        const WRITE = 0b0010;
        const CLOSE = 0b0100;
        const ERROR = 0b1000;
    }
}

/// The observable a reaction's body receives when its fd becomes ready.
#[derive(Copy, Clone, Debug)]
pub struct Event {
    pub fd: RawFd,
    pub events: Interest,
}

struct Entry {
    fd: RawFd,
    interest: Interest,
    reaction: Arc<Reaction>,
}

struct State {
    entries: Vec<Entry>,
    dirty: bool,
    shutdown: bool,
}

pub(crate) struct IoPoller {
    state: Mutex<State>,
    self_pipe_read: RawFd,
    self_pipe_write: RawFd,
    scheduler: Arc<Scheduler>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl IoPoller {
    pub(crate) fn new(scheduler: Arc<Scheduler>) -> crate::error::Result<Arc<Self>> {
        let mut fds = [0 as RawFd; 2];
        // Safety: `fds` is a valid pointer to two `RawFd` slots, as
        // required by `pipe(2)`.
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if rc != 0 {
            return Err(crate::error::Error::bind(
                "failed to create self-pipe",
                std::io::Error::last_os_error(),
            ));
        }
        for fd in fds {
            set_nonblocking(fd)?;
        }

        let poller = Arc::new(IoPoller {
            state: Mutex::new(State {
                entries: Vec::new(),
                dirty: true,
                shutdown: false,
            }),
            self_pipe_read: fds[0],
            self_pipe_write: fds[1],
            scheduler,
            thread: Mutex::new(None),
        });

        let weak = Arc::downgrade(&poller);
        let handle = std::thread::Builder::new()
            .name("io-poller".into())
            .spawn(move || poll_loop(weak))
            .expect("failed to spawn io poller thread");
        *poller.thread.lock().unwrap() = Some(handle);

        Ok(poller)
    }

    pub(crate) fn register(&self, fd: RawFd, interest: Interest, reaction: Arc<Reaction>) {
        let mut state = self.state.lock().unwrap();
        state.entries.push(Entry {
            fd,
            interest,
            reaction,
        });
        state.dirty = true;
        drop(state);
        self.wake();
    }

    pub(crate) fn unregister(&self, reaction_id: u64) {
        let mut state = self.state.lock().unwrap();
        state.entries.retain(|e| e.reaction.id != reaction_id);
        state.dirty = true;
        drop(state);
        self.wake();
    }

    fn wake(&self) {
        // Safety: `self_pipe_write` is a valid, owned, nonblocking fd; a
        // short write of one byte cannot block and a full pipe (meaning a
        // wakeup is already pending) is not an error worth reporting.
        unsafe {
            let byte = 1u8;
            libc::write(self.self_pipe_write, &byte as *const u8 as *const _, 1);
        }
    }

    pub(crate) fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.shutdown = true;
        drop(state);
        self.wake();
    }

    pub(crate) fn join(&self) {
        if let Some(handle) = self.thread.lock().unwrap().take() {
            match handle.join() {
                Ok(()) => {}
                Err(panic) => std::panic::resume_unwind(panic),
            }
        }
    }
}

impl Drop for IoPoller {
    fn drop(&mut self) {
        // Safety: both fds are owned by this struct and not used again
        // after this point.
        unsafe {
            libc::close(self.self_pipe_read);
            libc::close(self.self_pipe_write);
        }
    }
}

fn set_nonblocking(fd: RawFd) -> crate::error::Result<()> {
    // Safety: `fd` is a valid, open file descriptor owned by the caller
    // for the duration of this call.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(crate::error::Error::bind(
                "fcntl(F_GETFL) failed",
                std::io::Error::last_os_error(),
            ));
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) != 0 {
            return Err(crate::error::Error::bind(
                "fcntl(F_SETFL) failed",
                std::io::Error::last_os_error(),
            ));
        }
    }
    Ok(())
}

fn poll_loop(poller: std::sync::Weak<IoPoller>) {
    loop {
        let Some(poller) = poller.upgrade() else {
            return;
        };

        let (mut pollfds, entries_snapshot, shutdown) = {
            let mut state = poller.state.lock().unwrap();
            if state.shutdown {
                return;
            }
            state.dirty = false;
            let mut pollfds = Vec::with_capacity(state.entries.len() + 1);
            pollfds.push(libc::pollfd {
                fd: poller.self_pipe_read,
                events: libc::POLLIN,
                revents: 0,
            });
            for entry in &state.entries {
                pollfds.push(libc::pollfd {
                    fd: entry.fd,
                    events: interest_to_events(entry.interest),
                    revents: 0,
                });
            }
            let snapshot: Vec<(RawFd, Arc<Reaction>)> = state
                .entries
                .iter()
                .map(|e| (e.fd, Arc::clone(&e.reaction)))
                .collect();
            (pollfds, snapshot, state.shutdown)
        };
        if shutdown {
            return;
        }

        // Safety: `pollfds` is a valid array of `len` `pollfd` structs for
        // the duration of this call; the poller never holds its state
        // lock across this blocking wait (§4.5 concurrency note).
        let rc = unsafe {
            libc::poll(
                pollfds.as_mut_ptr(),
                pollfds.len() as libc::nfds_t,
                -1,
            )
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            log::warn!("poll(2) failed: {err}");
            continue;
        }

        if pollfds[0].revents != 0 {
            drain_self_pipe(poller.self_pipe_read);
        }

        for (pfd, (fd, reaction)) in pollfds.iter().skip(1).zip(entries_snapshot.iter()) {
            if pfd.revents == 0 {
                continue;
            }
            let events = events_to_interest(pfd.revents);
            let event = Event { fd: *fd, events };
            let reaction = Arc::clone(reaction);
            let scheduler = Arc::clone(&poller.scheduler);
            crate::bus::with_event(&event, || {
                if let Some(task) = reaction.generate(scheduler.next_sequence()) {
                    scheduler.submit(task);
                }
            });
        }

        // Rebuild is amortized: if binds/unbinds happened while we were
        // blocked in poll(2), `dirty` is already set and the next
        // iteration picks up the new fd set from `state.entries` directly.
    }
}

fn drain_self_pipe(fd: RawFd) {
    let mut buf = [0u8; 64];
    loop {
        // Safety: `fd` is the poller's own nonblocking read end; `buf` is
        // a valid buffer of the given length.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut _, buf.len()) };
        if n <= 0 {
            break;
        }
    }
}

fn interest_to_events(interest: Interest) -> libc::c_short {
    let mut events = 0;
    if interest.contains(Interest::READ) {
        events |= libc::POLLIN;
    }
    if interest.contains(Interest::WRITE) {
        events |= libc::POLLOUT;
    }
    events as libc::c_short
}

fn events_to_interest(revents: libc::c_short) -> Interest {
    let mut interest = Interest::empty();
    let revents = revents as i32;
    if revents & libc::POLLIN != 0 {
        interest |= Interest::READ;
    }
    if revents & libc::POLLOUT != 0 {
        interest |= Interest::WRITE;
    }
    if revents & libc::POLLHUP != 0 {
        interest |= Interest::CLOSE;
    }
    if revents & libc::POLLERR != 0 {
        interest |= Interest::ERROR;
    }
    interest
}
