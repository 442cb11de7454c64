use std::{ffi::CStr, mem};

use libc::{FILE, c_char, fclose, fopen, free, malloc, strcpy};
use rpool::Pool;
use tracing_subscriber::EnvFilter;

/// Lives in a large allocation and points at resources the pool does not own.
#[repr(C)]
struct Data {
  ptr: *mut c_char,
  file: *mut FILE,
}

fn main() {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
    .init();

  // --------------------------------------------------------------------
  // 1) A 512 byte pool. The header eats into it, so anything above
  //    `max()` is served as a large allocation.
  // --------------------------------------------------------------------
  let mut pool = match Pool::new(512) {
    Ok(pool) => pool,
    Err(err) => {
      eprintln!("pool creation failed: {err}");
      std::process::exit(1);
    }
  };
  println!("[1] Pool created, small/large threshold = {} bytes", pool.max());

  // --------------------------------------------------------------------
  // 2) 128 bytes: bumped out of the first block.
  // --------------------------------------------------------------------
  let small = match pool.allocate(128) {
    Ok(ptr) => ptr,
    Err(err) => {
      eprintln!("allocate 128 bytes failed: {err}");
      std::process::exit(1);
    }
  };
  println!("[2] 128 bytes at {:?}, in a block: {}", small, pool.contains(small.as_ptr(), 128));

  // --------------------------------------------------------------------
  // 3) 512 bytes: above the threshold, straight from the provider.
  // --------------------------------------------------------------------
  let large = match pool.allocate(512) {
    Ok(ptr) => ptr.cast::<Data>(),
    Err(err) => {
      eprintln!("allocate 512 bytes failed: {err}");
      std::process::exit(1);
    }
  };
  println!("[3] 512 bytes at {:?}, large records = {}", large, pool.large_count());

  // --------------------------------------------------------------------
  // 4) Point the large block at resources from outside the pool.
  // --------------------------------------------------------------------
  let data = unsafe {
    let data = large.as_ptr();

    (*data).ptr = malloc(12) as *mut c_char;
    strcpy((*data).ptr, c"hello world".as_ptr());
    (*data).file = fopen(c"data.txt".as_ptr(), c"w".as_ptr());

    println!(
      "[4] buffer = {:?} ({:?}), file = {:?}",
      (*data).ptr,
      CStr::from_ptr((*data).ptr),
      (*data).file
    );

    &*data
  };

  // --------------------------------------------------------------------
  // 5) Cleanups. Registered buffer first, file second, so the file is
  //    closed first when the pool goes away.
  // --------------------------------------------------------------------
  match pool.cleanup_add(mem::size_of::<*mut c_char>()) {
    Ok(cleanup) => {
      cleanup.set_data(data.ptr as *mut u8);
      cleanup.set_handler(|ptr| {
        println!("free buffer {:?}", ptr);
        unsafe { free(ptr as *mut libc::c_void) };
      });
    }
    Err(err) => eprintln!("cleanup for buffer failed: {err}"),
  }

  match pool.cleanup_add(mem::size_of::<*mut FILE>()) {
    Ok(cleanup) => {
      cleanup.set_data(data.file as *mut u8);
      cleanup.set_handler(|file| {
        println!("close file {:?}", file);
        if !file.is_null() {
          unsafe { fclose(file as *mut FILE) };
        }
      });
    }
    Err(err) => eprintln!("cleanup for file failed: {err}"),
  }

  // --------------------------------------------------------------------
  // 6) End of demo. Dropping the pool:
  //    1. runs the cleanups, newest first
  //    2. releases the large allocation
  //    3. releases every block
  // --------------------------------------------------------------------
  println!("[6] Dropping the pool");
}
