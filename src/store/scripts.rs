//! Embedded Lua scripts for the multi-key transfers the store needs to
//! perform atomically (spec sections 4.1, 4.4, 4.7).
//!
//! Scripts are loaded once with `include_str!` and held as `redis::Script`
//! values, mirroring `RedisScript` in the `apalis-redis` storage adapter
//! this module is grounded on.

use redis::Script;

#[derive(Clone)]
pub struct Scripts {
    /// `LREM` one match off a source list, `LPUSH` it onto a destination
    /// list if (and only if) the removal succeeded.
    pub atomic_move: Script,
    /// Same as `atomic_move`, but re-checks a heartbeat key is still
    /// absent before touching anything, server-side.
    pub guarded_reap_move: Script,
}

impl Default for Scripts {
    fn default() -> Self {
        Self {
            atomic_move: Script::new(include_str!("lua/atomic_move.lua")),
            guarded_reap_move: Script::new(include_str!("lua/guarded_reap_move.lua")),
        }
    }
}
