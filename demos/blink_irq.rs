//! Blink Example - LED toggled from a timer interrupt on STM32F401
//!
//! TIM2 update interrupts reach the kernel through the NVIC port; the
//! handler toggles PA5 and reports every toggle to process context through
//! the mailbox.

#![no_std]
#![no_main]

use cortex_m_rt::entry;
use cortex_m_semihosting::hprintln;
use portable_atomic::{AtomicU32, Ordering};

use rexos::critical::CriticalSection;
use rexos::ipc::IpcMessage;
use rexos::irq::{IrqHandler, IsrContext, Vector};
use rexos::port::{install, with_kernel, NvicLines};
use rexos::types::{hal, ipc_item, Cmd, Irq, ProcessHandle};
use rexos::Kernel;

use stm32_metapac as pac;

/// TIM2 global interrupt on STM32F401
const TIM2_IRQ: u8 = 28;
const TIM2_PRIORITY: u8 = 4;

/// Notification posted on every toggle
const BLINK_NOTE: Cmd = Cmd::new(hal::SYSTEM, ipc_item::IPC_USER);

static mut KERNEL: Kernel<'static, NvicLines> = Kernel::new(NvicLines::new(4));

// ============ LED Control ============

fn led_init() {
    pac::RCC.ahb1enr().modify(|w| w.set_gpioaen(true));
    pac::GPIOA.moder().modify(|w| w.set_moder(5, pac::gpio::vals::Moder::OUTPUT));
    pac::GPIOA.otyper().modify(|w| w.set_ot(5, pac::gpio::vals::Ot::PUSHPULL));
}

fn led_set(on: bool) {
    if on {
        pac::GPIOA.bsrr().write(|w| w.set_bs(5, true));
    } else {
        pac::GPIOA.bsrr().write(|w| w.set_br(5, true));
    }
}

/// 2 Hz update event from the 16 MHz HSI
fn timer_init() {
    pac::RCC.apb1enr().modify(|w| w.set_tim2en(true));
    pac::TIM2.psc().write_value(16_000 - 1);
    pac::TIM2.arr().write_value(500 - 1);
    pac::TIM2.dier().modify(|w| w.set_uie(true));
    pac::TIM2.cr1().modify(|w| w.set_cen(true));
}

// ============ Interrupt handler ============

struct Blinker {
    toggles: AtomicU32,
}

impl IrqHandler for Blinker {
    fn handle(&self, _cs: &CriticalSection, _irq: Irq, ctx: &mut IsrContext<'_>) {
        pac::TIM2.sr().modify(|w| w.set_uif(false));
        let n = self.toggles.fetch_add(1, Ordering::Relaxed) + 1;
        led_set(n & 1 == 1);
        let note = IpcMessage::new(BLINK_NOTE, ProcessHandle::KERNEL).with_params(n, 0, 0);
        let _ = ctx.io.ipost(note);
    }
}

static BLINKER: Blinker = Blinker {
    toggles: AtomicU32::new(0),
};

// ============ Main ============

#[entry]
fn main() -> ! {
    hprintln!("blink_irq: starting");
    led_init();

    // SAFETY: the only reference to KERNEL, handed to the port before any
    // interrupt is unmasked.
    install(unsafe { &mut *core::ptr::addr_of_mut!(KERNEL) });

    let Some(irq) = Irq::new(TIM2_IRQ) else {
        panic!("TIM2 outside the vector table");
    };
    let installed = with_kernel(|k| {
        let cs = CriticalSection::enter();
        k.irq.register_vector(&cs, irq, Vector::Handler(&BLINKER));
        let prio = k.irq.set_priority(&cs, irq, TIM2_PRIORITY);
        k.irq.lines_mut().unmask(irq);
        prio
    });
    if installed != Some(Ok(())) {
        panic!("TIM2 vector not installed");
    }

    timer_init();
    rexos::info!("blink_irq: TIM2 on vector {=u8}", TIM2_IRQ);

    loop {
        cortex_m::asm::wfi();
        while let Some(msg) = with_kernel(|k| k.receive()).flatten() {
            if msg.cmd == BLINK_NOTE {
                rexos::info!("blink_irq: toggle {=u32}", msg.param1);
            }
        }
    }
}
