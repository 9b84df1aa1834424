pub mod keyboard;
pub mod timer;
pub mod tty;

pub fn init() {
    timer::init();
    keyboard::init();
    tty::init();
    crate::log_info!("Drivers subsystem initialized.");
}
