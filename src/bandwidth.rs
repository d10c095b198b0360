//! Hierarchical bandwidth limiting.
//!
//! Limits form a tree: the session root owns per-torrent nodes, which own
//! per-peer leaves. A peer asks `clamp` how many bytes it may move right
//! now (the minimum of the available tokens along its path to the root) and
//! reports actual transfer through `consume`, which charges every ancestor
//! and feeds the speed windows.
//!
//! Token refill happens once per scheduler tick via `allocate` on the root.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::bitfield::Bitfield;

/// Transfer direction, from our point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Up, Direction::Down];

    fn index(self) -> usize {
        match self {
            Direction::Up => 0,
            Direction::Down => 1,
        }
    }
}

/// How far back the speed estimate looks.
const SPEED_WINDOW: Duration = Duration::from_secs(5);

/// Unused tokens may accumulate up to this many ticks' worth.
const BURST_TICKS: u64 = 2;

#[derive(Default)]
struct SpeedWindow {
    samples: VecDeque<(Instant, u64)>,
}

impl SpeedWindow {
    fn record(&mut self, now: Instant, bytes: u64) {
        self.samples.push_back((now, bytes));
    }

    fn speed_bps(&mut self, now: Instant) -> u64 {
        while let Some(&(t, _)) = self.samples.front() {
            if now.duration_since(t) > SPEED_WINDOW {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        let total: u64 = self.samples.iter().map(|&(_, n)| n).sum();
        total / SPEED_WINDOW.as_secs()
    }
}

#[derive(Default)]
struct DirState {
    is_limited: bool,
    desired_bps: u64,
    bytes_left: u64,
    raw: SpeedWindow,
    piece: SpeedWindow,
}

struct Node {
    parent: Mutex<Weak<Node>>,
    children: Mutex<Vec<Weak<Node>>>,
    dirs: [Mutex<DirState>; 2],
}

impl Node {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            parent: Mutex::new(Weak::new()),
            children: Mutex::new(Vec::new()),
            dirs: [Mutex::new(DirState::default()), Mutex::new(DirState::default())],
        })
    }

    fn allocate(self: &Arc<Self>) {
        for dir in Direction::ALL {
            let mut state = self.dirs[dir.index()].lock();
            if state.is_limited {
                let cap = state.desired_bps.saturating_mul(BURST_TICKS);
                state.bytes_left = state.bytes_left.saturating_add(state.desired_bps).min(cap);
            }
        }

        let mut children = self.children.lock();
        children.retain(|child| {
            if let Some(child) = child.upgrade() {
                child.allocate();
                true
            } else {
                false
            }
        });
    }
}

/// A node in the bandwidth tree. Cloning shares the node; dropping the last
/// handle detaches it from its parent on the next refill.
#[derive(Clone)]
pub struct Bandwidth {
    node: Arc<Node>,
}

impl Bandwidth {
    /// Creates an unparented node, typically the session root.
    pub fn new() -> Self {
        Self { node: Node::new() }
    }

    /// Creates a node whose `clamp`/`consume` chain through `self`.
    pub fn new_child(&self) -> Self {
        let child = Self { node: Node::new() };
        child.set_parent(Some(self));
        child
    }

    pub fn set_parent(&self, parent: Option<&Bandwidth>) {
        match parent {
            Some(parent) => {
                *self.node.parent.lock() = Arc::downgrade(&parent.node);
                parent.node.children.lock().push(Arc::downgrade(&self.node));
            }
            None => {
                *self.node.parent.lock() = Weak::new();
            }
        }
    }

    pub fn set_limited(&self, dir: Direction, is_limited: bool) {
        let mut state = self.node.dirs[dir.index()].lock();
        state.is_limited = is_limited;
        if !is_limited {
            state.bytes_left = 0;
        }
    }

    pub fn is_limited(&self, dir: Direction) -> bool {
        self.node.dirs[dir.index()].lock().is_limited
    }

    pub fn set_desired_bps(&self, dir: Direction, bps: u64) {
        let mut state = self.node.dirs[dir.index()].lock();
        state.desired_bps = bps;
        state.bytes_left = state.bytes_left.min(bps.saturating_mul(BURST_TICKS));
    }

    pub fn desired_bps(&self, dir: Direction) -> u64 {
        self.node.dirs[dir.index()].lock().desired_bps
    }

    /// Refills tokens for this node and every live descendant. Call once
    /// per tick on the root.
    pub fn allocate(&self) {
        self.node.allocate();
    }

    /// How many of `wanted` bytes may move now, honoring every limited
    /// ancestor.
    pub fn clamp(&self, dir: Direction, wanted: u64) -> u64 {
        let mut allowed = wanted;
        let mut cursor = Some(self.node.clone());
        while let Some(node) = cursor {
            {
                let state = node.dirs[dir.index()].lock();
                if state.is_limited {
                    allowed = allowed.min(state.bytes_left);
                }
            }
            cursor = node.parent.lock().upgrade();
        }
        allowed
    }

    /// Accounts an actual transfer, charging this node and every ancestor.
    pub fn consume(&self, dir: Direction, bytes: u64, is_piece_data: bool, now: Instant) {
        let mut cursor = Some(self.node.clone());
        while let Some(node) = cursor {
            {
                let mut state = node.dirs[dir.index()].lock();
                if state.is_limited {
                    state.bytes_left = state.bytes_left.saturating_sub(bytes);
                }
                state.raw.record(now, bytes);
                if is_piece_data {
                    state.piece.record(now, bytes);
                }
            }
            cursor = node.parent.lock().upgrade();
        }
    }

    /// Observed rate including protocol overhead.
    pub fn raw_speed_bps(&self, dir: Direction, now: Instant) -> u64 {
        self.node.dirs[dir.index()].lock().raw.speed_bps(now)
    }

    /// Observed rate of piece payload only.
    pub fn piece_speed_bps(&self, dir: Direction, now: Instant) -> u64 {
        self.node.dirs[dir.index()].lock().piece.speed_bps(now)
    }
}

impl Default for Bandwidth {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------
// Turtle mode
// ---------------------------------------------------------------------

pub const MINUTES_PER_DAY: usize = 60 * 24;
pub const MINUTES_PER_WEEK: usize = MINUTES_PER_DAY * 7;

/// What the clock scheduler last decided, so it won't fight the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoSwitchState {
    Unused,
    On,
    Off,
}

/// Alternate speed regime and its weekly schedule.
///
/// `days` is a bitmask with bit 0 = Sunday. When `end_minute` is not after
/// `begin_minute`, the window wraps into the next day.
pub struct TurtleInfo {
    pub up_bps: u64,
    pub down_bps: u64,
    pub is_enabled: bool,
    pub is_clock_enabled: bool,
    pub days: u8,
    pub begin_minute: u16,
    pub end_minute: u16,
    pub auto_switch_state: AutoSwitchState,
    minutes: Bitfield,
}

impl TurtleInfo {
    pub fn new(up_bps: u64, down_bps: u64) -> Self {
        let mut info = Self {
            up_bps,
            down_bps,
            is_enabled: false,
            is_clock_enabled: false,
            days: 0x7f,
            begin_minute: 540, // 09:00
            end_minute: 1020,  // 17:00
            auto_switch_state: AutoSwitchState::Unused,
            minutes: Bitfield::new(MINUTES_PER_WEEK),
        };
        info.update_table();
        info
    }

    /// Rebuilds the per-minute week map from `(begin, end, days)`.
    pub fn update_table(&mut self) {
        self.minutes.set_has_none();

        for day in 0..7 {
            if self.days & (1 << day) == 0 {
                continue;
            }
            let begin = self.begin_minute as usize;
            let mut end = self.end_minute as usize;
            if end <= begin {
                end += MINUTES_PER_DAY;
            }
            for minute in begin..end {
                self.minutes.set((minute + day * MINUTES_PER_DAY) % MINUTES_PER_WEEK);
            }
        }
    }

    /// Whether the schedule wants turtle mode on at this minute of the week.
    pub fn test_time(&self, minute_of_week: usize) -> bool {
        minute_of_week < MINUTES_PER_WEEK && self.minutes.has(minute_of_week)
    }

    /// Clock tick. Returns the new enabled state when the scheduler decides
    /// to flip it, or `None` when there is nothing to do (clock disabled, or
    /// this transition was already applied and possibly overridden by the
    /// user since).
    pub fn check_clock(&mut self, minute_of_week: usize) -> Option<bool> {
        if !self.is_clock_enabled {
            return None;
        }

        let enabled = self.test_time(minute_of_week);
        let new_state = if enabled { AutoSwitchState::On } else { AutoSwitchState::Off };

        if self.auto_switch_state == new_state {
            return None;
        }

        self.auto_switch_state = new_state;
        self.is_enabled = enabled;
        Some(enabled)
    }

    /// A manual toggle. The scheduler's latched state is left alone: having
    /// already decided the current window, the clock stays quiet until the
    /// next transition, so it cannot immediately undo the user's choice.
    pub fn set_enabled_by_user(&mut self, enabled: bool) {
        self.is_enabled = enabled;
    }

    /// Called when the user edits the schedule itself: rebuild the table
    /// and, if the clock is on, apply its fresh opinion right away.
    pub fn user_poked_the_clock(&mut self, minute_of_week: usize) -> Option<bool> {
        self.auto_switch_state = AutoSwitchState::Unused;
        self.update_table();

        if !self.is_clock_enabled {
            return None;
        }
        self.check_clock(minute_of_week)
    }

    /// Called after the schedule fields are loaded or edited: rebuild the
    /// table and, if the clock is on, adopt its current opinion.
    pub fn bootstrap(&mut self, minute_of_week: usize) {
        self.auto_switch_state = AutoSwitchState::Unused;
        self.update_table();

        if self.is_clock_enabled {
            self.is_enabled = self.test_time(minute_of_week);
            self.auto_switch_state = if self.is_enabled {
                AutoSwitchState::On
            } else {
                AutoSwitchState::Off
            };
        }
    }
}
