//! Interrupt dispatch through the kernel trap entry
//!
//! Handlers record the vectors they run for; the order of that log is what
//! the pending queue promises.

use std::cell::RefCell;

use quickcheck_macros::quickcheck;

use rexos::config::{IRQ_LOWEST_PRIORITY, IRQ_VECTORS_COUNT};
use rexos::critical::CriticalSection;
use rexos::irq::{IrqHandler, IsrContext, PendingQueue, Vector};
use rexos::port::NullLines;
use rexos::types::{Irq, Priority};
use rexos::Kernel;

fn irq(n: u8) -> Irq {
    Irq::new(n).unwrap()
}

/// Logs every vector it services
#[derive(Default)]
struct Recorder {
    log: RefCell<Vec<u8>>,
}

impl Recorder {
    fn take(&self) -> Vec<u8> {
        self.log.take()
    }
}

impl IrqHandler for Recorder {
    fn handle(&self, _cs: &CriticalSection, irq: Irq, _ctx: &mut IsrContext<'_>) {
        self.log.borrow_mut().push(irq.number());
    }
}

/// Logs itself, then raises other vectors from inside the handler
struct Raiser<'r> {
    log: &'r Recorder,
    raises: Vec<Irq>,
}

impl IrqHandler for Raiser<'_> {
    fn handle(&self, cs: &CriticalSection, irq: Irq, ctx: &mut IsrContext<'_>) {
        self.log.handle(cs, irq, ctx);
        for &r in &self.raises {
            ctx.raise(r);
        }
    }
}

fn install<'a>(k: &mut Kernel<'a, NullLines>, n: u8, prio: Priority, handler: &'a dyn IrqHandler) {
    let cs = CriticalSection::enter();
    k.irq.register_vector(&cs, irq(n), Vector::Handler(handler));
    k.irq.set_priority(&cs, irq(n), prio).unwrap();
}

// ============ Scenarios ============

#[test]
fn test_raised_vectors_run_by_priority() {
    let rec = Recorder::default();
    let low = Raiser {
        log: &rec,
        raises: vec![irq(2), irq(3)],
    };
    let mut k = Kernel::new(NullLines::new());
    install(&mut k, 1, 10, &low);
    install(&mut k, 2, 5, &rec);
    install(&mut k, 3, 2, &rec);

    k.irq_entry(irq(1));

    // raised X (prio 5) before Y (prio 2); Y still runs first
    assert_eq!(rec.take(), [1, 3, 2]);
    assert!(k.irq.pending().is_empty());
    assert_eq!(k.irq.current_vector(), None);
}

#[test]
fn test_entry_claims_most_urgent_latched_vector() {
    let rec = Recorder::default();
    let mut k = Kernel::new(NullLines::new());
    install(&mut k, 7, 12, &rec);
    install(&mut k, 8, 1, &rec);
    install(&mut k, 9, 6, &rec);
    {
        let cs = CriticalSection::enter();
        k.irq.push_pending(&cs, irq(9));
        k.irq.push_pending(&cs, irq(8));
    }
    k.irq_entry(irq(7));
    assert_eq!(rec.take(), [8, 9, 7]);
}

#[test]
fn test_equal_priorities_run_in_arrival_order() {
    let rec = Recorder::default();
    let mut k = Kernel::new(NullLines::new());
    for n in [4, 11, 6] {
        install(&mut k, n, 3, &rec);
    }
    {
        let cs = CriticalSection::enter();
        k.irq.push_pending(&cs, irq(11));
        k.irq.push_pending(&cs, irq(6));
    }
    k.irq_entry(irq(4));
    assert_eq!(rec.take(), [11, 6, 4]);
}

#[test]
fn test_relatched_vector_runs_once() {
    let rec = Recorder::default();
    let mut k = Kernel::new(NullLines::new());
    install(&mut k, 5, 3, &rec);
    install(&mut k, 6, 3, &rec);
    {
        let cs = CriticalSection::enter();
        k.irq.push_pending(&cs, irq(5));
        k.irq.push_pending(&cs, irq(5));
    }
    k.irq_entry(irq(6));
    assert_eq!(rec.take(), [5, 6]);
}

#[test]
fn test_cleared_vector_does_not_run() {
    let rec = Recorder::default();
    let mut k = Kernel::new(NullLines::new());
    install(&mut k, 12, 2, &rec);
    install(&mut k, 13, 9, &rec);
    {
        let cs = CriticalSection::enter();
        k.irq.push_pending(&cs, irq(12));
    }
    assert!(k.irq.clear_pending(irq(12)));
    assert!(!k.irq.clear_pending(irq(12)));
    k.irq_entry(irq(13));
    assert_eq!(rec.take(), [13]);
}

#[test]
fn test_unregister_drops_pending_entry() {
    let rec = Recorder::default();
    let mut k = Kernel::new(NullLines::new());
    install(&mut k, 20, 4, &rec);
    let cs = CriticalSection::enter();
    k.irq.push_pending(&cs, irq(20));
    k.irq.unregister_vector(&cs, irq(20));
    assert!(!k.irq.pending().contains(irq(20)));
    assert!(!k.irq.vector(irq(20)).is_assigned());
}

#[test]
fn test_stray_vector_is_counted() {
    let rec = Recorder::default();
    let mut k = Kernel::new(NullLines::new());
    install(&mut k, 0, 0, &rec);
    k.irq_entry(irq(30));
    k.irq_entry(irq(0));
    assert_eq!(k.irq.stray_count(), 1);
    assert_eq!(rec.take(), [0]);
}

#[test]
fn test_fiq_bypasses_pending_queue() {
    let rec = Recorder::default();
    let fast = Recorder::default();
    let mut k = Kernel::new(NullLines::new());
    install(&mut k, 3, 0, &rec);
    {
        let cs = CriticalSection::enter();
        k.irq.fiq_register_vector(&cs, irq(25), Vector::Handler(&fast));
        k.irq.push_pending(&cs, irq(3));
    }
    assert_eq!(k.irq.lines().fiq(), Some(irq(25)));

    k.fiq_entry();
    assert_eq!(fast.take(), [25]);
    assert!(rec.take().is_empty());
    assert!(k.irq.pending().contains(irq(3)));

    let cs = CriticalSection::enter();
    k.irq.fiq_unregister_vector(&cs);
    assert_eq!(k.irq.lines().fiq(), None);
    drop(cs);
    // no FIQ source: logged and ignored
    k.fiq_entry();
    assert!(fast.take().is_empty());
}

// ============ Properties ============

fn priorities(raw: &[u8]) -> [Priority; IRQ_VECTORS_COUNT] {
    let mut p = [IRQ_LOWEST_PRIORITY; IRQ_VECTORS_COUNT];
    for (slot, &r) in p.iter_mut().zip(raw) {
        *slot = r % (IRQ_LOWEST_PRIORITY + 1);
    }
    p
}

fn vectors(raw: &[u8]) -> Vec<Irq> {
    raw.iter().map(|&n| irq(n % IRQ_VECTORS_COUNT as u8)).collect()
}

/// First arrival of each vector, stably sorted by priority
fn expected_order(pushes: &[Irq], prios: &[Priority; IRQ_VECTORS_COUNT]) -> Vec<Irq> {
    let mut seen = 0u32;
    let mut order: Vec<Irq> = pushes
        .iter()
        .copied()
        .filter(|i| {
            let fresh = seen & i.mask() == 0;
            seen |= i.mask();
            fresh
        })
        .collect();
    order.sort_by_key(|i| prios[i.index()]);
    order
}

#[quickcheck]
fn qc_pop_order_is_priority_then_fifo(raw_prios: Vec<u8>, raw_pushes: Vec<u8>) -> bool {
    let prios = priorities(&raw_prios);
    let pushes = vectors(&raw_pushes);
    let mut q = PendingQueue::new();
    for &i in &pushes {
        q.push(i, &prios);
    }
    let popped: Vec<Irq> = std::iter::from_fn(|| q.pop()).collect();
    popped == expected_order(&pushes, &prios)
}

#[quickcheck]
fn qc_membership_matches_queue(raw_prios: Vec<u8>, raw_pushes: Vec<u8>, raw_removes: Vec<u8>) -> bool {
    let prios = priorities(&raw_prios);
    let mut q = PendingQueue::new();
    for i in vectors(&raw_pushes) {
        q.push(i, &prios);
    }
    for i in vectors(&raw_removes) {
        q.remove(i);
    }
    let listed: Vec<Irq> = q.iter().collect();
    let mut dedup = listed.clone();
    dedup.sort();
    dedup.dedup();
    dedup.len() == listed.len()
        && listed.len() == q.len()
        && (0..IRQ_VECTORS_COUNT as u8).all(|n| q.contains(irq(n)) == listed.contains(&irq(n)))
}

#[quickcheck]
fn qc_clear_removes_only_target(raw_prios: Vec<u8>, raw_pushes: Vec<u8>, target: u8) -> bool {
    let prios = priorities(&raw_prios);
    let target = irq(target % IRQ_VECTORS_COUNT as u8);
    let mut q = PendingQueue::new();
    for i in vectors(&raw_pushes) {
        q.push(i, &prios);
    }
    let before: Vec<Irq> = q.iter().filter(|&i| i != target).collect();
    q.remove(target);
    !q.contains(target) && q.iter().collect::<Vec<_>>() == before
}

#[quickcheck]
fn qc_every_latched_vector_runs_once(raw_prios: Vec<u8>, raw_pushes: Vec<u8>) -> bool {
    let pushes = vectors(&raw_pushes);
    let Some((&entry, latched)) = pushes.split_last() else {
        return true;
    };
    let prios = priorities(&raw_prios);
    let rec = Recorder::default();
    let mut k = Kernel::new(NullLines::new());
    for n in 0..IRQ_VECTORS_COUNT as u8 {
        install(&mut k, n, prios[n as usize], &rec);
    }
    {
        let cs = CriticalSection::enter();
        for &i in latched {
            k.irq.push_pending(&cs, i);
        }
    }
    k.irq_entry(entry);

    let ran: Vec<Irq> = rec.take().into_iter().map(irq).collect();
    ran == expected_order(&pushes, &prios) && k.irq.pending().is_empty()
}
