//! Legacy 8259A PIC (Programmable Interrupt Controller).
//!
//! Two cascaded 8259As handle the hardware IRQs this kernel cares about,
//! remapped off the CPU exception vectors (0-31) onto 32-47:
//!
//! ```text
//! Master PIC (0x20-0x21)          Slave PIC (0xA0-0xA1)
//! IRQ 0 - Timer                   IRQ  8 - RTC
//! IRQ 1 - Keyboard                IRQ  9 - ACPI
//! IRQ 2 - Cascade                 IRQ 10 - Free
//! IRQ 3 - COM2                    IRQ 11 - Free
//! IRQ 4 - COM1                    IRQ 12 - Mouse
//! IRQ 5 - LPT2                    IRQ 13 - FPU
//! IRQ 6 - Floppy                  IRQ 14 - Primary ATA
//! IRQ 7 - LPT1                    IRQ 15 - Secondary ATA
//! ```

use spin::Mutex;
use x86_64::instructions::port::Port;

const PIC1_COMMAND: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_COMMAND: u16 = 0xA0;
const PIC2_DATA: u16 = 0xA1;

const CMD_EOI: u8 = 0x20;

const ICW1_INIT: u8 = 0x10;
const ICW1_ICW4: u8 = 0x01;
const ICW4_8086: u8 = 0x01;

pub const PIC1_OFFSET: u8 = 32;
pub const PIC2_OFFSET: u8 = PIC1_OFFSET + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Irq {
    Timer = 0,
    Keyboard = 1,
    Cascade = 2,
    COM2 = 3,
    COM1 = 4,
    LPT2 = 5,
    Floppy = 6,
    LPT1 = 7,
    RTC = 8,
    ACPI = 9,
    Free1 = 10,
    Free2 = 11,
    Mouse = 12,
    FPU = 13,
    PrimaryATA = 14,
    SecondaryATA = 15,
}

impl Irq {
    pub fn to_vector(self) -> u8 {
        let irq = self as u8;
        if irq < 8 {
            PIC1_OFFSET + irq
        } else {
            PIC2_OFFSET + (irq - 8)
        }
    }

    pub fn from_vector(vector: u8) -> Option<Self> {
        let irq = if vector >= PIC1_OFFSET && vector < PIC1_OFFSET + 8 {
            vector - PIC1_OFFSET
        } else if vector >= PIC2_OFFSET && vector < PIC2_OFFSET + 8 {
            (vector - PIC2_OFFSET) + 8
        } else {
            return None;
        };

        match irq {
            0 => Some(Irq::Timer),
            1 => Some(Irq::Keyboard),
            2 => Some(Irq::Cascade),
            3 => Some(Irq::COM2),
            4 => Some(Irq::COM1),
            5 => Some(Irq::LPT2),
            6 => Some(Irq::Floppy),
            7 => Some(Irq::LPT1),
            8 => Some(Irq::RTC),
            9 => Some(Irq::ACPI),
            10 => Some(Irq::Free1),
            11 => Some(Irq::Free2),
            12 => Some(Irq::Mouse),
            13 => Some(Irq::FPU),
            14 => Some(Irq::PrimaryATA),
            15 => Some(Irq::SecondaryATA),
            _ => None,
        }
    }
}

pub struct ChainedPics {
    master_command: Port<u8>,
    master_data: Port<u8>,
    slave_command: Port<u8>,
    slave_data: Port<u8>,
    master_offset: u8,
    slave_offset: u8,
}

impl ChainedPics {
    pub const fn new(master_offset: u8, slave_offset: u8) -> Self {
        Self {
            master_command: Port::new(PIC1_COMMAND),
            master_data: Port::new(PIC1_DATA),
            slave_command: Port::new(PIC2_COMMAND),
            slave_data: Port::new(PIC2_DATA),
            master_offset,
            slave_offset,
        }
    }

    /// # Safety
    /// Must run with interrupts disabled; after this, interrupts stay
    /// masked until `enable_irq` is called explicitly.
    pub unsafe fn initialize(&mut self) {
        self.master_command.write(ICW1_INIT | ICW1_ICW4);
        io_wait();
        self.slave_command.write(ICW1_INIT | ICW1_ICW4);
        io_wait();

        self.master_data.write(self.master_offset);
        io_wait();
        self.slave_data.write(self.slave_offset);
        io_wait();

        self.master_data.write(0x04); // IRQ2 has a slave behind it
        io_wait();
        self.slave_data.write(0x02); // cascade identity
        io_wait();

        self.master_data.write(ICW4_8086);
        io_wait();
        self.slave_data.write(ICW4_8086);
        io_wait();

        self.master_data.write(0xFF);
        self.slave_data.write(0xFF);
    }

    /// # Safety
    /// A handler must already be registered for this IRQ in the IDT.
    pub unsafe fn enable_irq(&mut self, irq: u8) {
        if irq < 8 {
            let mask = self.master_data.read();
            self.master_data.write(mask & !(1 << irq));
        } else {
            let irq = irq - 8;
            let mask = self.slave_data.read();
            self.slave_data.write(mask & !(1 << irq));

            let master_mask = self.master_data.read();
            self.master_data.write(master_mask & !(1 << 2));
        }
    }

    pub unsafe fn disable_irq(&mut self, irq: u8) {
        if irq < 8 {
            let mask = self.master_data.read();
            self.master_data.write(mask | (1 << irq));
        } else {
            let irq = irq - 8;
            let mask = self.slave_data.read();
            self.slave_data.write(mask | (1 << irq));
        }
    }

    /// # Safety
    /// Must be called exactly once per interrupt.
    pub unsafe fn notify_end_of_interrupt(&mut self, vector: u8) {
        let is_slave = vector >= self.slave_offset && vector < self.slave_offset + 8;
        if is_slave {
            self.slave_command.write(CMD_EOI);
        }
        self.master_command.write(CMD_EOI);
    }

    pub unsafe fn disable(&mut self) {
        self.master_data.write(0xFF);
        self.slave_data.write(0xFF);
    }

    /// Spurious IRQs can occur on master IRQ7 / slave IRQ15; check the
    /// in-service register before sending EOI for those vectors.
    pub unsafe fn is_spurious(&mut self, vector: u8) -> bool {
        if vector == self.master_offset + 7 {
            self.master_command.write(0x0B);
            let isr = self.master_command.read();
            return (isr & 0x80) == 0;
        } else if vector == self.slave_offset + 7 {
            self.slave_command.write(0x0B);
            let isr = self.slave_command.read();
            return (isr & 0x80) == 0;
        }
        false
    }
}

pub static PICS: Mutex<ChainedPics> = Mutex::new(ChainedPics::new(PIC1_OFFSET, PIC2_OFFSET));

/// # Safety
/// Must run exactly once during boot, with interrupts disabled.
pub unsafe fn init() {
    PICS.lock().initialize();

    crate::arch::x86_64::serial::serial_write(b"[PIC] Legacy 8259A PIC initialized\n");
    crate::arch::x86_64::serial::serial_write(b"[PIC] Master: IRQ 0-7 -> Vectors 32-39\n");
    crate::arch::x86_64::serial::serial_write(b"[PIC] Slave:  IRQ 8-15 -> Vectors 40-47\n");
}

/// # Safety
/// A handler must be registered in the IDT before enabling the IRQ.
pub unsafe fn enable_irq(irq: Irq) {
    PICS.lock().enable_irq(irq as u8);
}

pub unsafe fn disable_irq(irq: Irq) {
    PICS.lock().disable_irq(irq as u8);
}

/// # Safety
/// Must be called exactly once per interrupt, at the end of its handler.
pub unsafe fn end_of_interrupt(vector: u8) {
    PICS.lock().notify_end_of_interrupt(vector);
}

pub unsafe fn disable() {
    PICS.lock().disable();
    crate::arch::x86_64::serial::serial_write(b"[PIC] Legacy PIC disabled\n");
}

#[inline]
fn io_wait() {
    unsafe {
        Port::<u8>::new(0x80).write(0u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_irq_vector_conversion() {
        assert_eq!(Irq::Timer.to_vector(), 32);
        assert_eq!(Irq::Keyboard.to_vector(), 33);
        assert_eq!(Irq::COM1.to_vector(), 36);
        assert_eq!(Irq::RTC.to_vector(), 40);
        assert_eq!(Irq::Mouse.to_vector(), 44);
    }

    #[test]
    fn test_vector_to_irq() {
        assert_eq!(Irq::from_vector(32), Some(Irq::Timer));
        assert_eq!(Irq::from_vector(33), Some(Irq::Keyboard));
        assert_eq!(Irq::from_vector(40), Some(Irq::RTC));
        assert_eq!(Irq::from_vector(44), Some(Irq::Mouse));
        assert_eq!(Irq::from_vector(100), None);
    }
}
