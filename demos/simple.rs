//! Maps a DLL from disk without ever calling `LoadLibrary`, then runs its
//! entry point via `DLL_PROCESS_ATTACH` (no export is called).
#![cfg(windows)]

use std::env;
use std::fs;

fn main() {
    env_logger::init();

    let path = env::args().nth(1).expect("usage: simple <path-to-dll>");
    let bytes = fs::read(&path).expect("couldn't read file");

    let module = manualpe::LoadedModule::load(&bytes).expect("couldn't map module");
    println!(
        "mapped {} at base {:#x} (initialized: {})",
        path,
        module.base(),
        module.is_initialized()
    );
    // `module` unloads (entry point DLL_PROCESS_DETACH, dependency unwind,
    // virtual-memory release) when it drops here.
}
