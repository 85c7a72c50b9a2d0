// src/lua.rs - Lua scripts for atomic lease operations
use redis::Script;

pub struct LuaScripts {
    pub lease: Script,
    pub finish: Script,
    pub reclaim: Script,
}

impl LuaScripts {
    pub fn new() -> Self {
        // Script hashes are computed here; redis-rs loads the body on the
        // first NOSCRIPT reply.
        Self {
            lease: Script::new(include_str!("./lua/lease.lua")),
            finish: Script::new(include_str!("./lua/finish.lua")),
            reclaim: Script::new(include_str!("./lua/reclaim.lua")),
        }
    }
}

impl Default for LuaScripts {
    fn default() -> Self {
        Self::new()
    }
}
