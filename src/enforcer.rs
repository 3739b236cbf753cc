// Reconciles declarative client policy into kernel TC state on one egress
// interface.
//
// The root qdisc is an HTB whose classes form a linear priority spine:
// helper class 1:rootHTBMinorHelper(p) branches into the queue class
// 1:rootHTBMinor(p) for priority p and the next helper for everything below,
// ending in the best-effort default 1:rootHTBMinorDefault(). Each queue class
// carries a DSMARK qdisc that stamps the priority's DSCP code, and below
// that a base HTB qdisc under which per-client rate limiter chains hang.
// Filters on the root HTB steer (dst, src) flows into their priority queue;
// filters on a base HTB steer them into their client's rate limiter chain.

use crate::clients::{ClientKey, ClientState, ClientTable};
use crate::command::Options;
use crate::handles::HandleMap;
use crate::tc::TcDriver;
use log::warn;
use std::net::Ipv4Addr;
use std::time::Instant;

/// Maximum number of HTB rate limit stages per client beyond the first.
/// A chain supplies up to (NUM_LEVELS + 1) * 2 rate/burst values.
pub const NUM_LEVELS: u32 = 5;

/// A filter's prio field doubles as the client identity (id + 1) so removal
/// can name the filter again. With one filter per client the evaluation
/// order it nominally controls never matters.
fn filter_prio(id: u32) -> u32 {
    id + 1
}

/// Owns everything the enforcement core needs: configuration, the handle
/// layout, the TC driver, and the client table.
pub struct Enforcer {
    max_rate: u64,
    num_priorities: u32,
    num_levels: u32,
    handles: HandleMap,
    tc: TcDriver,
    clients: ClientTable,
}

impl Enforcer {
    pub fn new(options: &Options) -> Self {
        Self::with_driver(
            options.max_rate,
            options.num_priorities,
            NUM_LEVELS,
            TcDriver::new(&options.dev),
        )
    }

    pub fn with_driver(max_rate: u64, num_priorities: u32, num_levels: u32, tc: TcDriver) -> Self {
        Self {
            max_rate,
            num_priorities,
            num_levels,
            handles: HandleMap::new(num_priorities, num_levels),
            tc,
            clients: ClientTable::new(),
        }
    }

    pub fn num_priorities(&self) -> u32 {
        self.num_priorities
    }

    pub fn num_levels(&self) -> u32 {
        self.num_levels
    }

    pub fn clients(&self) -> &ClientTable {
        &self.clients
    }

    /// Install the root qdisc/class hierarchy. Run once at startup; begins by
    /// deleting whatever root qdisc a previous run may have left behind.
    pub fn install_root(&mut self) {
        self.tc.remove_root();
        // Reserve 1% of the link for each priority level; leftover capacity
        // goes to the highest priority
        let min_rate = self.max_rate / 100;
        let mut rate = min_rate * (self.num_priorities as u64 + 1);
        let mut ceil = self.max_rate;
        self.tc.install_root_htb(self.handles.root_htb_minor_default());
        self.tc.add_root_htb_class(
            None,
            self.handles.root_htb_minor_helper(0),
            self.max_rate,
            None,
            0,
        );
        for priority in 0..self.num_priorities {
            self.tc.add_root_htb_class(
                Some(self.handles.root_htb_minor_helper(priority)),
                self.handles.root_htb_minor(priority),
                min_rate,
                Some(ceil),
                priority,
            );
            self.tc.add_dsmark_qdisc(
                self.handles.root_htb_handle(),
                self.handles.root_htb_minor(priority),
                self.handles.dsmark_handle(priority),
            );
            // Highest priority (0) is cs7
            let value = 7u8.wrapping_sub(priority as u8).wrapping_shl(5);
            self.tc.set_dsmark_dscp(self.handles.dsmark_handle(priority), value);
            self.tc.add_htb_qdisc(
                self.handles.dsmark_handle(priority),
                1,
                self.handles.htb_base_handle(priority),
            );
            rate -= min_rate;
            ceil -= min_rate;
            self.tc.add_root_htb_class(
                Some(self.handles.root_htb_minor_helper(priority)),
                self.handles.root_htb_minor_helper(priority + 1),
                rate,
                Some(ceil),
                priority + 1,
            );
        }
    }

    /// Remove the root qdisc; the kernel cascades the whole hierarchy.
    pub fn teardown(&mut self) {
        self.tc.remove_root();
    }

    /// Apply a client's desired priority and rate limit chain, emitting the
    /// minimal TC mutations to converge from whatever was installed before.
    /// `priority == num_priorities` removes the client. `rates`/`bursts` are
    /// parallel arrays holding (rate, ceil) pairs per stage.
    pub fn update_client(
        &mut self,
        dst: Ipv4Addr,
        src: Ipv4Addr,
        priority: u32,
        rates: &[f64],
        bursts: &[f64],
    ) {
        self.update_client_at(dst, src, priority, rates, bursts, Instant::now());
    }

    /// Remove a client and revert its flows to best-effort defaults.
    pub fn remove_client(&mut self, dst: Ipv4Addr, src: Ipv4Addr) {
        self.update_client(dst, src, self.num_priorities, &[], &[]);
    }

    /// Utilization of the client's assigned rate since the last query,
    /// clamped to [0, 1]. Resets the accounting window.
    pub fn get_occupancy(&mut self, dst: Ipv4Addr, src: Ipv4Addr) -> f64 {
        self.get_occupancy_at(dst, src, Instant::now())
    }

    fn update_client_at(
        &mut self,
        dst: Ipv4Addr,
        src: Ipv4Addr,
        priority: u32,
        rates: &[f64],
        bursts: &[f64],
        now: Instant,
    ) {
        if rates.len() != bursts.len() {
            warn!(
                "Mismatched rate limit chain for dst {} src {}: {} rates vs {} bursts",
                dst,
                src,
                rates.len(),
                bursts.len()
            );
            return;
        }
        let key: ClientKey = (dst, src);
        let (mut c, old_priority, old_len) = match self.clients.get(&key).copied() {
            // Removing a client we never knew: nothing to do, no id consumed
            None if priority == self.num_priorities => return,
            None => (self.clients.insert_new(key, now), self.num_priorities, 0),
            Some(mut c) => {
                // Settle byte accounting under the old leaf class before
                // anything moves
                Self::update_sent_bytes_at(&mut self.tc, &self.handles, &mut c, now);
                let (old_priority, old_len) = (c.priority, c.rate_limit_length);
                (c, old_priority, old_len)
            }
        };

        c.priority = priority;
        c.rate_limit_length = rates.len();
        // Occupancy budgeting assumes the first-stage rate
        c.rate = if rates.is_empty() {
            self.max_rate as f64
        } else {
            rates[0]
        };

        // Walk the new chain, installing or refreshing one qdisc/class pair
        // per stage
        let id = c.id;
        let mut level: usize = 0;
        let mut parent_handle = self.handles.htb_base_handle(priority);
        let mut minor = self.handles.htb_minor(id, 0);
        let mut child_handle = self.handles.htb_handle(id, priority, 0);
        while level * 2 < rates.len() {
            if level > 0 {
                // A deeper qdisc already exists only where the old chain
                // reached at this priority
                if level * 2 >= old_len || old_priority != priority {
                    self.tc.add_htb_qdisc(parent_handle, minor, child_handle);
                }
                parent_handle = child_handle;
                minor = self.handles.htb_minor(id, level as u32);
                child_handle = self.handles.htb_handle(id, priority, level as u32);
            }
            let rate = rates[level * 2] as u64;
            let burst = bursts[level * 2] as u64;
            let (ceil, cburst) = if level * 2 + 1 < rates.len() {
                (rates[level * 2 + 1] as u64, bursts[level * 2 + 1] as u64)
            } else {
                (rate, burst)
            };
            self.tc.add_htb_class(parent_handle, minor, rate, ceil, burst, cburst);
            level += 1;
        }

        if !rates.is_empty() && (old_len == 0 || old_priority != priority) {
            // Steer the flow into its level 0 rate limiter class
            self.tc.add_ip4_filter(
                self.handles.htb_base_handle(priority),
                filter_prio(id),
                dst,
                src,
                self.handles.htb_minor(id, 0),
            );
        }

        if old_priority != priority {
            // The leaf class changed identity; old kernel counters no longer
            // compare
            c.prev_sent_bytes = 0;
            if old_priority < self.num_priorities {
                self.tc.remove_filter(self.handles.root_htb_handle(), filter_prio(id));
            }
            if priority < self.num_priorities {
                self.tc.add_ip4_filter(
                    self.handles.root_htb_handle(),
                    filter_prio(id),
                    dst,
                    src,
                    self.handles.root_htb_minor(priority),
                );
            }
        }

        if old_len > 2 {
            if old_priority != priority {
                // Drop the old chain from its root; descendants cascade
                self.tc.remove_qdisc(
                    self.handles.htb_base_handle(old_priority),
                    self.handles.htb_minor(id, 0),
                    self.handles.htb_handle(id, old_priority, 0),
                );
            } else if level * 2 < old_len {
                // Chain shrank: the first orphaned qdisc takes the rest with it
                self.tc.remove_qdisc(parent_handle, minor, child_handle);
            }
        }

        if old_len > 0 && (rates.is_empty() || old_priority != priority) {
            // The client no longer participates at the old priority
            self.tc.remove_filter(self.handles.htb_base_handle(old_priority), filter_prio(id));
            self.tc.remove_class(
                self.handles.htb_base_handle(old_priority),
                self.handles.htb_minor(id, 0),
            );
        }

        if priority == self.num_priorities {
            self.clients.remove(&key);
        } else {
            self.clients.put(key, c);
        }
    }

    fn get_occupancy_at(&mut self, dst: Ipv4Addr, src: Ipv4Addr, now: Instant) -> f64 {
        let key: ClientKey = (dst, src);
        // Only clients with an installed rate limiter have a leaf class whose
        // counters mean anything; unknown pairs are never inserted
        let mut c = match self.clients.get(&key).copied() {
            Some(c) if c.rate_limit_length > 0 => c,
            _ => return 0.0,
        };
        Self::update_sent_bytes_at(&mut self.tc, &self.handles, &mut c, now);
        let mut occupancy = if c.max_sent_bytes > 0.0 {
            c.sent_bytes as f64 / c.max_sent_bytes
        } else {
            0.0
        };
        if occupancy > 1.0 {
            // Shouldn't happen often, if at all
            warn!("Capping occupancy {:.3} at 1", occupancy);
            occupancy = 1.0;
        }
        c.sent_bytes = 0;
        c.max_sent_bytes = 0.0;
        self.clients.put(key, c);
        occupancy
    }

    /// Fold the leaf class counter delta and the elapsed-time allowance into
    /// the client's accounting window.
    fn update_sent_bytes_at(
        tc: &mut TcDriver,
        handles: &HandleMap,
        c: &mut ClientState,
        now: Instant,
    ) {
        if c.rate_limit_length == 0 {
            return;
        }
        let current = tc.read_sent_bytes(
            handles.htb_base_handle(c.priority),
            handles.htb_minor(c.id, 0),
        );
        // saturating: a replaced class restarts its counter at zero
        c.sent_bytes += current.saturating_sub(c.prev_sent_bytes);
        c.prev_sent_bytes = current;
        c.max_sent_bytes += c.rate * now.duration_since(c.last_sent_bytes_time).as_secs_f64();
        c.last_sent_bytes_time = now;
    }
}
