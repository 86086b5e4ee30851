//! Maps a DLL, resolves one of its exports by name, and calls it.
#![cfg(windows)]

use std::env;
use std::ffi::CString;
use std::fs;

type ExportFn = unsafe extern "C" fn() -> i32;

fn main() {
    env_logger::init();

    let mut args = env::args().skip(1);
    let path = args.next().expect("usage: dll <path-to-dll> <export-name>");
    let export = args.next().expect("usage: dll <path-to-dll> <export-name>");
    let bytes = fs::read(&path).expect("couldn't read file");

    let module = manualpe::LoadedModule::load(&bytes).expect("couldn't map module");
    let name = CString::new(export.clone()).expect("export name has an embedded NUL");
    let addr = module.resolve(&name).expect("export not found");

    let f: ExportFn = unsafe { std::mem::transmute(addr as usize) };
    let result = unsafe { f() };
    println!("{export} returned {result}");
}
