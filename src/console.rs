use core::fmt;
use core::mem::transmute;
use core::sync::atomic::{AtomicUsize, Ordering};

// Output goes through a registered sink so the same kernel code can print to
// a UART on hardware or to captured output under test. No sink, no output.
static SINK: AtomicUsize = AtomicUsize::new(0);

pub fn set_sink(sink: fn(&str)) {
    SINK.store(sink as usize, Ordering::SeqCst);
}

pub fn clear_sink() {
    SINK.store(0, Ordering::SeqCst);
}

pub fn _print(args: fmt::Arguments) {
    let sink = SINK.load(Ordering::SeqCst);
    if sink != 0 {
        let func: fn(&str) = unsafe { transmute(sink) };
        func(&alloc::format!("{}", args));
    }
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::console::_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}
