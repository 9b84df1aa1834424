//! PS/2 keyboard. The interrupt half decodes scancodes into a lock-free
//! ring of console bytes and wakes the blocked reader, if any; `readchar`
//! suspends the calling thread until a byte arrives. Serialization between
//! readers is the console input mutex in the tty layer, so at most one
//! thread is ever parked here.

pub mod scancodes;

use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};
use lazy_static::lazy_static;
use spin::Mutex;

use crate::arch::{self, Port};
use crate::interrupts::idt::{self, KEYBOARD_VECTOR};
use crate::scheduler::{self, task::Thread};
use scancodes::ScancodeDecoder;

const BUFFER_SIZE: usize = 256;

const PS2_DATA: u16 = 0x60;

/// Single-producer (interrupt) / single-consumer (reader thread) byte ring.
pub struct InputBuffer {
    buffer: [u8; BUFFER_SIZE],
    head: AtomicUsize,
    tail: AtomicUsize,
}

impl InputBuffer {
    pub const fn new() -> InputBuffer {
        InputBuffer {
            buffer: [0; BUFFER_SIZE],
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, byte: u8) -> Result<(), ()> {
        let head = self.head.load(Ordering::Acquire);
        let next_head = (head + 1) % BUFFER_SIZE;
        if next_head == self.tail.load(Ordering::Acquire) {
            return Err(()); // full; drop the keystroke
        }
        // Producer owns the head slot; the atomic indices fence the consumer
        // away from it, so the raw write cannot race.
        unsafe {
            let slot = self.buffer.as_ptr().add(head) as *mut u8;
            *slot = byte;
        }
        self.head.store(next_head, Ordering::Release);
        Ok(())
    }

    pub fn pop(&self) -> Option<u8> {
        let tail = self.tail.load(Ordering::Acquire);
        if tail == self.head.load(Ordering::Acquire) {
            return None;
        }
        let byte = unsafe { *self.buffer.as_ptr().add(tail) };
        self.tail.store((tail + 1) % BUFFER_SIZE, Ordering::Release);
        Some(byte)
    }
}

lazy_static! {
    static ref INPUT: InputBuffer = InputBuffer::new();
    static ref DECODER: Mutex<ScancodeDecoder> = Mutex::new(ScancodeDecoder::new());
    /// The one thread (if any) blocked waiting for input.
    static ref READER: Mutex<Option<Arc<Thread>>> = Mutex::new(None);
}

pub fn init() {
    // Drain any scancode the 8042 latched during boot.
    let mut data: Port = Port::new(PS2_DATA);
    let _ = data.read();
    crate::log_info!("PS/2 keyboard driver initialized.");
}

/// IRQ 1. Interrupts are off; the scheduler lock is safe to take.
pub fn handle_irq() {
    let mut data: Port = Port::new(PS2_DATA);
    let scancode = data.read();

    if let Some(byte) = DECODER.lock().decode(scancode) {
        let _ = INPUT.push(byte);
        if let Some(reader) = READER.lock().take() {
            scheduler::wake(&reader, false);
        }
    }
    idt::ack_interrupt(KEYBOARD_VECTOR);
}

/// Block until a console byte arrives. Caller holds the console input mutex.
pub fn readchar() -> u8 {
    loop {
        // Park-or-consume must be atomic against the interrupt handler.
        arch::disable_interrupts();
        if let Some(byte) = INPUT.pop() {
            arch::enable_interrupts();
            return byte;
        }
        *READER.lock() = Some(scheduler::current_thread());
        scheduler::block_current();
        arch::enable_interrupts();
    }
}
