//! Queue event stream and signal delivery.
//!
//! Events ride a second lock-free list in the same arena as the items. A
//! record is only created when the event's subscription bit is set **and** a
//! monitor process is registered; delivery is a fire-and-forget real-time
//! signal (`sigqueue`). Three independent registrations exist:
//!
//! * **monitor** — receives the event signal when records are queued;
//! * **listener** — signaled on item arrival while a remover could be
//!   waiting (`READ_SEM` at zero);
//! * **caller** — signaled when a remove is about to block.
//!
//! Each registration is a single-writer pid/signal slot pair updated by CAS.
//! A delivery that fails because the process died unregisters it.

use bitflags::bitflags;
use log::warn;

use crate::arena::Arena;
use crate::error::Error;
use crate::list;
use crate::pr;
use crate::queue::qh;
use crate::sem;

bitflags! {
    /// Behavior toggles and per-event subscription bits in the shared
    /// `FLAGS` slot.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct Flags: i64 {
        /// First item has been seen.
        const ACTIVATED = 1;
        /// Drop expired items inside remove.
        const DISCARD_EXPIRED = 2;
        /// Adaptive LIFO once depth crosses `LEVEL`.
        const LIFO_ON_LEVEL = 4;
        const EVNT_INIT = 8;
        const EVNT_LIMIT = 16;
        const EVNT_TIME = 32;
        const EVNT_LEVEL = 64;
        const EVNT_EMPTY = 128;
        const EVNT_NONEMPTY = 256;
    }
}

/// Asynchronous queue events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Nothing pending.
    None,
    /// First item ever added.
    Init,
    /// Add rejected because the queue sat at its depth cap.
    Limit,
    /// An item was found past its time limit.
    Time,
    /// Depth crossed the configured level.
    Level,
    /// Count went from positive to zero.
    Empty,
    /// Count went from zero to positive.
    Nonempty,
    /// Every event class; valid for subscription calls only.
    All,
}

impl Event {
    pub(crate) fn code(self) -> i64 {
        match self {
            Event::None => 0,
            Event::Init => 1,
            Event::Limit => 2,
            Event::Time => 3,
            Event::Level => 4,
            Event::Empty => 5,
            Event::Nonempty => 6,
            Event::All => -1,
        }
    }

    pub(crate) fn from_code(code: i64) -> Event {
        match code {
            1 => Event::Init,
            2 => Event::Limit,
            3 => Event::Time,
            4 => Event::Level,
            5 => Event::Empty,
            6 => Event::Nonempty,
            _ => Event::None,
        }
    }

    /// Subscription bits selecting this event.
    pub(crate) fn flag(self) -> Flags {
        match self {
            Event::Init => Flags::EVNT_INIT,
            Event::Limit => Flags::EVNT_LIMIT,
            Event::Time => Flags::EVNT_TIME,
            Event::Level => Flags::EVNT_LEVEL,
            Event::Empty => Flags::EVNT_EMPTY,
            Event::Nonempty => Flags::EVNT_NONEMPTY,
            Event::All => Flags::EVNT_INIT
                .union(Flags::EVNT_LIMIT)
                .union(Flags::EVNT_TIME)
                .union(Flags::EVNT_LEVEL)
                .union(Flags::EVNT_EMPTY)
                .union(Flags::EVNT_NONEMPTY),
            Event::None => Flags::empty(),
        }
    }
}

pub(crate) fn is_monitored(arena: &Arena) -> bool {
    arena.hread(qh::NOTIFY_PID) != 0 && arena.hread(qh::NOTIFY_SIGNAL) != 0
}

pub(crate) fn is_call_monitored(arena: &Arena) -> bool {
    arena.hread(qh::CALL_PID) != 0 && arena.hread(qh::CALL_SIGNAL) != 0
}

pub(crate) fn is_subscribed(arena: &Arena, event: Event) -> bool {
    let bits = event.flag().bits();
    bits != 0 && arena.flags() & bits == bits
}

/// Queue an event record if it is subscribed and a monitor is registered.
/// Returns true when a record was added. Failures to allocate or link a
/// record are swallowed; a lost notification never fails the data path.
pub(crate) fn add_event(arena: &Arena, event: Event) -> bool {
    if event == Event::None || !is_subscribed(arena, event) || !is_monitored(arena) {
        return false;
    }
    let Ok(node) = arena.alloc_node() else {
        return false;
    };
    let Ok(p) = arena.span(node, crate::arena::NODE_SLOTS) else {
        return false;
    };
    pr::store(unsafe { p.add(qh::EVENT_OFFSET as usize) }, event.code());
    list::add_end(arena, node, qh::EVENT_TAIL).is_ok()
}

/// Queue and signal in one step.
pub(crate) fn notify_event(arena: &Arena, event: Event) {
    if is_monitored(arena) && add_event(arena, event) {
        signal_event(arena);
    }
}

/// Pop the oldest pending event, or `Event::None`.
pub(crate) fn next_event(arena: &Arena) -> Result<Event, Error> {
    loop {
        let gen = arena.hread(qh::EVENT_HD_CNT);
        let head = arena.hread(qh::EVENT_HEAD);
        if head == arena.hread(qh::EVENT_TAIL) {
            return Ok(Event::None);
        }
        let p = arena.span(head, 2)?;
        let next = pr::load(p);
        if !arena.valid_ref(next) {
            return Ok(Event::None);
        }
        let np = arena.span(next, crate::arena::NODE_SLOTS)?;
        let event = Event::from_code(pr::load(unsafe { np.add(qh::EVENT_OFFSET as usize) }));
        if list::remove_front(arena, head, gen, qh::EVENT_HEAD, qh::EVENT_TAIL)? != 0 {
            arena.free_node(head)?;
            return Ok(event);
        }
    }
}

/// Fire-and-forget a signal at a registered pid; unregister it when the
/// process is gone.
fn deliver(arena: &Arena, pid_off: i64, sig_off: i64) {
    let pid = arena.hread(pid_off);
    let signal = arena.hread(sig_off);
    if pid == 0 || signal == 0 {
        return;
    }
    let sv = libc::sigval {
        sival_ptr: core::ptr::null_mut(),
    };
    let rc = unsafe { libc::sigqueue(pid as libc::pid_t, signal as libc::c_int, sv) };
    if rc < 0 && unsafe { *libc::__errno_location() } == libc::ESRCH {
        // Monitor died; silently unsubscribe it.
        if arena.hcas(pid_off, pid, 0) {
            arena.hwrite(sig_off, 0);
            warn!("unregistered dead pid {pid} from notifications");
        }
    }
}

/// Signal the monitor that event records are pending.
pub(crate) fn signal_event(arena: &Arena) {
    deliver(arena, qh::NOTIFY_PID, qh::NOTIFY_SIGNAL);
}

/// Signal the listener about an arrival, but only while a remover could be
/// blocked (read semaphore at zero).
pub(crate) fn signal_arrival(arena: &Arena) {
    if arena.hread(qh::LISTEN_PID) == 0 || arena.hread(qh::LISTEN_SIGNAL) == 0 {
        return;
    }
    if let Ok(0) = unsafe { sem::value(arena.h(qh::READ_SEM)) } {
        deliver(arena, qh::LISTEN_PID, qh::LISTEN_SIGNAL);
    }
}

/// Signal the caller registration that a remove is about to block.
pub(crate) fn signal_call(arena: &Arena) {
    deliver(arena, qh::CALL_PID, qh::CALL_SIGNAL);
}

/// Register (non-zero signal) or unregister (zero) the calling process in a
/// pid/signal slot pair. Unregistering demands the slot hold our own pid.
pub(crate) fn register(arena: &Arena, pid_off: i64, sig_off: i64, signal: i32) -> Result<(), Error> {
    if signal < 0 {
        return Err(Error::Arg);
    }
    let pid = i64::from(unsafe { libc::getpid() });
    if signal == 0 {
        if arena.hread(pid_off) != pid {
            return Err(Error::State);
        }
        if arena.hcas(pid_off, pid, 0) {
            arena.hwrite(sig_off, 0);
            return Ok(());
        }
        return Err(Error::State);
    }
    let prev = arena.hread(pid_off);
    if arena.hcas(pid_off, prev, pid) {
        arena.hwrite(sig_off, i64::from(signal));
        return Ok(());
    }
    Err(Error::State)
}
