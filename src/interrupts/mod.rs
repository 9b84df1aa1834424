pub mod gdt;
pub mod idt;
pub mod traps;
pub mod usermode;

pub fn init() {
    gdt::init();
    idt::init();
    idt::PICS.lock().initialize();
}
