/// Maps (priority, client id, level) to TC qdisc handles and class minors.
///
/// TC names qdiscs by a 16-bit handle (`handle:`) and classes by a handle
/// plus minor (`handle:minor`). Every allocator below hands out numbers from
/// a range that starts where the previous range ends, so handles and minors
/// never collide as long as client ids are unique.
#[derive(Debug, Clone, Copy)]
pub struct HandleMap {
    num_priorities: u32,
    num_levels: u32,
}

impl HandleMap {
    pub fn new(num_priorities: u32, num_levels: u32) -> Self {
        Self {
            num_priorities,
            num_levels,
        }
    }

    /// Handle of the root HTB qdisc.
    pub fn root_htb_handle(&self) -> u32 {
        1
    }

    /// Minor within the root HTB for the class carrying a priority level's queue.
    pub fn root_htb_minor(&self, priority: u32) -> u32 {
        priority + 1
    }

    /// Minor within the root HTB for the helper class above a priority level.
    /// The helpers form the linear spine of the priority tree.
    pub fn root_htb_minor_helper(&self, priority: u32) -> u32 {
        priority + self.root_htb_minor(self.num_priorities)
    }

    /// Minor within the root HTB for the terminal best-effort class; this is
    /// the root qdisc's `default`.
    pub fn root_htb_minor_default(&self) -> u32 {
        self.root_htb_minor_helper(self.num_priorities)
    }

    /// Handle of the DSMARK qdisc marking DSCP for a priority level.
    /// Starts after the root HTB minors to avoid reusing numbers.
    pub fn dsmark_handle(&self, priority: u32) -> u32 {
        priority + self.root_htb_minor_default() + 1
    }

    /// Handle of the base HTB qdisc rooting a priority level's rate limiters.
    pub fn htb_base_handle(&self, priority: u32) -> u32 {
        priority + self.dsmark_handle(self.num_priorities)
    }

    /// Handle of a client's per-level rate limiter qdisc.
    pub fn htb_handle(&self, id: u32, priority: u32, level: u32) -> u32 {
        let offset = (id * self.num_priorities * self.num_levels) + (priority * self.num_levels) + level;
        offset + self.htb_base_handle(self.num_priorities)
    }

    /// Minor of a client's class within its rate limiter qdiscs.
    /// Minor 1 is reserved by HTB for default traffic, so level 0 classes
    /// start at 2 and deeper levels reuse the default minor.
    pub fn htb_minor(&self, id: u32, level: u32) -> u32 {
        if level == 0 {
            id + 2
        } else {
            1
        }
    }
}
