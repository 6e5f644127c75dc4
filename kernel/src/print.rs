// Print macros for kernel output. Everything funnels through the printk
// buffer so a whole format lands on the console in one locked write.

/// Format to the console without a trailing newline.
#[macro_export]
macro_rules! printk {
    ($($arg:tt)*) => ($crate::drivers::console::_printk(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::printk!($($arg)*));
}

#[macro_export]
macro_rules! println {
    () => ($crate::printk!("\n"));
    ($($arg:tt)*) => ($crate::printk!("{}\n", format_args!($($arg)*)));
}
