/*
 * Interrupt Descriptor Table (IDT)
 *
 * CPU exceptions fail fast: they log and halt (or panic, for the ones that
 * can't plausibly be survived) rather than attempt recovery, matching the
 * core's "programming errors are fail-fast" rule (see SPEC_FULL.md §7).
 * IRQ 0 (the PIT/LAPIC timer) drives both the deferred-timer wheel and the
 * current CPU's scheduler tick; everything else just acknowledges the PIC.
 */

use lazy_static::lazy_static;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame};

/// Sends End-of-Interrupt to the PIC. IRQs >= 8 came through the slave and
/// need both chips acknowledged.
unsafe fn pic_eoi(irq: u8) {
    use x86_64::instructions::port::Port;
    if irq >= 8 {
        unsafe { Port::<u8>::new(0xA0).write(0x20u8) };
    }
    unsafe { Port::<u8>::new(0x20).write(0x20u8) };
}

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();

        idt.divide_error.set_handler_fn(fault_handler_divide_error);
        idt.debug.set_handler_fn(trap_handler_debug);
        idt.non_maskable_interrupt.set_handler_fn(fault_handler_nmi);
        idt.breakpoint.set_handler_fn(trap_handler_breakpoint);
        idt.overflow.set_handler_fn(trap_handler_overflow);
        idt.bound_range_exceeded.set_handler_fn(fault_handler_bound_range);
        idt.invalid_opcode.set_handler_fn(fault_handler_invalid_opcode);
        idt.device_not_available.set_handler_fn(fault_handler_device_not_available);
        unsafe {
            idt.double_fault
                .set_handler_fn(abort_handler_double_fault)
                .set_stack_index(crate::arch::x86_64::gdt::DOUBLE_FAULT_IST_INDEX);
        }
        idt.invalid_tss.set_handler_fn(fault_handler_invalid_tss);
        idt.segment_not_present.set_handler_fn(fault_handler_segment_not_present);
        idt.stack_segment_fault.set_handler_fn(fault_handler_stack_segment);
        idt.general_protection_fault.set_handler_fn(fault_handler_general_protection);
        idt.page_fault.set_handler_fn(fault_handler_page_fault);
        idt.x87_floating_point.set_handler_fn(fault_handler_x87_fp);
        idt.alignment_check.set_handler_fn(fault_handler_alignment_check);
        idt.machine_check.set_handler_fn(abort_handler_machine_check);
        idt.simd_floating_point.set_handler_fn(fault_handler_simd_fp);
        idt.virtualization.set_handler_fn(fault_handler_virtualization);
        idt.security_exception.set_handler_fn(fault_handler_security);

        // IRQ 0-15 map to vectors 32-47 behind the legacy 8259 PIC.
        idt[32].set_handler_fn(irq_handler_timer);
        idt[33].set_handler_fn(irq_handler_generic_ack); // keyboard, unused
        idt[36].set_handler_fn(irq_handler_generic_ack); // serial COM1
        idt[39].set_handler_fn(irq_handler_generic_ack); // serial COM2

        idt
    };
}

pub fn init() {
    IDT.load();
    log::info!(target: "arch", "IDT loaded");
}

fn halt_forever() -> ! {
    loop {
        x86_64::instructions::hlt();
    }
}

extern "x86-interrupt" fn fault_handler_divide_error(frame: InterruptStackFrame) {
    log::error!(target: "arch", "#DE divide error at {:?}", frame.instruction_pointer);
    halt_forever();
}

extern "x86-interrupt" fn trap_handler_debug(_frame: InterruptStackFrame) {
    log::trace!(target: "arch", "#DB debug trap");
}

extern "x86-interrupt" fn fault_handler_nmi(frame: InterruptStackFrame) {
    log::error!(target: "arch", "NMI at {:?}", frame.instruction_pointer);
    halt_forever();
}

extern "x86-interrupt" fn trap_handler_breakpoint(frame: InterruptStackFrame) {
    log::debug!(target: "arch", "#BP breakpoint at {:?}", frame.instruction_pointer);
}

extern "x86-interrupt" fn trap_handler_overflow(_frame: InterruptStackFrame) {
    log::warn!(target: "arch", "#OF overflow");
}

extern "x86-interrupt" fn fault_handler_bound_range(frame: InterruptStackFrame) {
    log::error!(target: "arch", "#BR bound range exceeded at {:?}", frame.instruction_pointer);
    halt_forever();
}

extern "x86-interrupt" fn fault_handler_invalid_opcode(frame: InterruptStackFrame) {
    log::error!(target: "arch", "#UD invalid opcode at {:?}", frame.instruction_pointer);
    halt_forever();
}

extern "x86-interrupt" fn fault_handler_device_not_available(frame: InterruptStackFrame) {
    log::error!(target: "arch", "#NM device not available at {:?}", frame.instruction_pointer);
    halt_forever();
}

extern "x86-interrupt" fn abort_handler_double_fault(frame: InterruptStackFrame, _error_code: u64) -> ! {
    log::error!(target: "arch", "#DF double fault at {:?}", frame.instruction_pointer);
    halt_forever();
}

extern "x86-interrupt" fn fault_handler_invalid_tss(frame: InterruptStackFrame, error_code: u64) {
    log::error!(target: "arch", "#TS invalid TSS {:#x} at {:?}", error_code, frame.instruction_pointer);
    halt_forever();
}

extern "x86-interrupt" fn fault_handler_segment_not_present(frame: InterruptStackFrame, error_code: u64) {
    log::error!(target: "arch", "#NP segment not present {:#x} at {:?}", error_code, frame.instruction_pointer);
    halt_forever();
}

extern "x86-interrupt" fn fault_handler_stack_segment(frame: InterruptStackFrame, error_code: u64) {
    log::error!(target: "arch", "#SS stack segment fault {:#x} at {:?}", error_code, frame.instruction_pointer);
    halt_forever();
}

extern "x86-interrupt" fn fault_handler_general_protection(frame: InterruptStackFrame, error_code: u64) {
    log::error!(target: "arch", "#GP general protection {:#x} at {:?}", error_code, frame.instruction_pointer);
    halt_forever();
}

extern "x86-interrupt" fn fault_handler_page_fault(
    frame: InterruptStackFrame,
    error_code: x86_64::structures::idt::PageFaultErrorCode,
) {
    use x86_64::registers::control::Cr2;
    let fault_addr = Cr2::read().ok();
    log::error!(
        target: "arch",
        "#PF page fault at {:?} (fault addr {:?}, code {:?}, rip {:?})",
        frame.instruction_pointer,
        fault_addr,
        error_code,
        frame.instruction_pointer
    );
    panic!("unrecoverable page fault");
}

extern "x86-interrupt" fn fault_handler_x87_fp(frame: InterruptStackFrame) {
    log::error!(target: "arch", "#MF x87 floating point exception at {:?}", frame.instruction_pointer);
    panic!("x87 floating point exception");
}

extern "x86-interrupt" fn fault_handler_alignment_check(frame: InterruptStackFrame, _error_code: u64) {
    log::error!(target: "arch", "#AC alignment check at {:?}", frame.instruction_pointer);
    panic!("alignment check exception");
}

extern "x86-interrupt" fn abort_handler_machine_check(frame: InterruptStackFrame) -> ! {
    log::error!(target: "arch", "#MC machine check at {:?}", frame.instruction_pointer);
    halt_forever();
}

extern "x86-interrupt" fn fault_handler_simd_fp(frame: InterruptStackFrame) {
    log::error!(target: "arch", "#XM SIMD floating point exception at {:?}", frame.instruction_pointer);
    panic!("SIMD floating point exception");
}

extern "x86-interrupt" fn fault_handler_virtualization(frame: InterruptStackFrame) {
    log::error!(target: "arch", "#VE virtualization exception at {:?}", frame.instruction_pointer);
    panic!("virtualization exception");
}

extern "x86-interrupt" fn fault_handler_security(frame: InterruptStackFrame, _error_code: u64) {
    log::error!(target: "arch", "#SX security exception at {:?}", frame.instruction_pointer);
    panic!("security exception");
}

/// Drives the deferred-timer wheel and the current CPU's scheduler tick.
/// Does not itself perform a context switch — arch-level stack swapping is
/// out of scope here (see `sched::cpu::Core::reschedule`'s note); it only
/// marks `needs_resched`, which `irql::lower` acts on the next time IRQL
/// drops below DISPATCH.
extern "x86-interrupt" fn irq_handler_timer(_frame: InterruptStackFrame) {
    crate::deferred::timer::tick();
    crate::sched::core(crate::sched::current_cpu()).tick();
    unsafe { pic_eoi(0) };
}

extern "x86-interrupt" fn irq_handler_generic_ack(_frame: InterruptStackFrame) {
    unsafe { pic_eoi(1) };
}
