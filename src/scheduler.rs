// Cycle accounting across the three clock domains plus the event queue.
// Everything is kept in "quantum" cycles, a virtual clock running at three
// times the ARM11 rate, so each domain's share converts with an integer
// ratio and a carried remainder instead of drifting.

use log::trace;

pub const ARM11_CLOCKRATE: u64 = 268_111_856;
pub const ARM9_CLOCKRATE: u64 = ARM11_CLOCKRATE / 2;
pub const XTENSA_CLOCKRATE: u64 = 40_000_000;

const MAX_CYCLES: i64 = 256;
const NO_EVENT: i64 = 0x7FFF_FFFF << 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockDomain {
    Arm11,
    Arm9,
    XtensaDsp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    VBlankStart,
    VBlankEnd,
    I2cTransfer,
    ClockChange,
}

struct SchedulerEvent {
    kind: EventKind,
    time_to_run: i64,
    param: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct CycleCount {
    count: i64,
    remainder: u64,
    clockrate: u64,
}

pub struct Scheduler {
    quantum: CycleCount,
    arm11: CycleCount,
    arm9: CycleCount,
    xtensa: CycleCount,

    quantum_cycles: i64,
    arm11_to_run: i64,
    arm9_to_run: i64,
    xtensa_to_run: i64,

    closest_event_time: i64,
    events: Vec<SchedulerEvent>,
}

impl Scheduler {
    pub fn new() -> Self {
        let mut scheduler = Scheduler {
            quantum: CycleCount::default(),
            arm11: CycleCount::default(),
            arm9: CycleCount::default(),
            xtensa: CycleCount::default(),
            quantum_cycles: 0,
            arm11_to_run: 0,
            arm9_to_run: 0,
            xtensa_to_run: 0,
            closest_event_time: NO_EVENT,
            events: Vec::new(),
        };
        scheduler.reset();
        scheduler
    }

    pub fn reset(&mut self) {
        self.quantum = CycleCount { count: 0, remainder: 0, clockrate: ARM11_CLOCKRATE * 3 };
        self.arm11 = CycleCount { count: 0, remainder: 0, clockrate: ARM11_CLOCKRATE };
        self.arm9 = CycleCount { count: 0, remainder: 0, clockrate: ARM9_CLOCKRATE };
        self.xtensa = CycleCount { count: 0, remainder: 0, clockrate: XTENSA_CLOCKRATE };
        self.quantum_cycles = 0;
        self.arm11_to_run = 0;
        self.arm9_to_run = 0;
        self.xtensa_to_run = 0;
        self.closest_event_time = NO_EVENT;
        self.events.clear();
    }

    // The New3DS kernel can step the ARM11 cluster to 2x/3x.
    pub fn set_arm11_clockrate(&mut self, rate: u64) {
        self.arm11.clockrate = rate;
    }

    pub fn arm11_clockrate(&self) -> u64 {
        self.arm11.clockrate
    }

    pub fn add_event(&mut self, kind: EventKind, cycles: i64, domain: ClockDomain, param: u64) {
        let clockrate = match domain {
            ClockDomain::Arm11 => self.arm11.clockrate,
            ClockDomain::Arm9 => self.arm9.clockrate,
            ClockDomain::XtensaDsp => self.xtensa.clockrate,
        };
        let time_to_run = self.quantum.count + cycles * (self.quantum.clockrate / clockrate) as i64;
        trace!("[Scheduler] event {:?} at quantum {}", kind, time_to_run);

        if time_to_run < self.closest_event_time {
            self.closest_event_time = time_to_run;
        }
        self.events.push(SchedulerEvent { kind, time_to_run, param });
    }

    pub fn calculate_cycles_to_run(&mut self) {
        let mut delta = self.closest_event_time - self.quantum.count;
        if delta > MAX_CYCLES {
            delta = MAX_CYCLES;
        }
        if delta < 0 {
            delta = 0;
        }
        self.quantum_cycles = delta;

        self.arm11_to_run = convert(&mut self.arm11, delta, self.quantum.clockrate);
        self.arm9_to_run = convert(&mut self.arm9, delta, self.quantum.clockrate);
        self.xtensa_to_run = convert(&mut self.xtensa, delta, self.quantum.clockrate);
    }

    pub fn arm11_cycles_to_run(&self) -> i64 {
        self.arm11_to_run
    }

    pub fn arm9_cycles_to_run(&self) -> i64 {
        self.arm9_to_run
    }

    pub fn xtensa_cycles_to_run(&self) -> i64 {
        self.xtensa_to_run
    }

    pub fn arm11_cycle_count(&self) -> i64 {
        self.arm11.count
    }

    pub fn arm9_cycle_count(&self) -> i64 {
        self.arm9.count
    }

    pub fn quantum_count(&self) -> i64 {
        self.quantum.count
    }

    // Advance time and hand back everything that came due; the orchestrator
    // dispatches since event effects reach across components.
    pub fn process_events(&mut self) -> Vec<(EventKind, u64)> {
        self.quantum.count += self.quantum_cycles;
        self.arm11.count += self.arm11_to_run;
        self.arm9.count += self.arm9_to_run;
        self.xtensa.count += self.xtensa_to_run;

        let mut fired = Vec::new();
        if self.quantum.count >= self.closest_event_time {
            let now = self.quantum.count;
            let mut new_closest = NO_EVENT;
            let mut remaining = Vec::new();
            for event in self.events.drain(..) {
                if event.time_to_run <= now {
                    fired.push((event.kind, event.param));
                } else {
                    if event.time_to_run < new_closest {
                        new_closest = event.time_to_run;
                    }
                    remaining.push(event);
                }
            }
            self.events = remaining;
            self.closest_event_time = new_closest;
        }
        fired
    }
}

// quantum-cycle delta -> domain cycles, carrying the truncated part forward.
fn convert(domain: &mut CycleCount, delta: i64, quantum_rate: u64) -> i64 {
    let numerator = delta as u64 * domain.clockrate + domain.remainder;
    domain.remainder = numerator % quantum_rate;
    (numerator / quantum_rate) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_conversion_tracks_ratio() {
        let mut scheduler = Scheduler::new();
        // With no events, every step is capped.
        let mut arm11_total = 0i64;
        let mut arm9_total = 0i64;
        let mut quantum_total = 0i64;
        for _ in 0..1000 {
            scheduler.calculate_cycles_to_run();
            arm11_total += scheduler.arm11_cycles_to_run();
            arm9_total += scheduler.arm9_cycles_to_run();
            quantum_total += 256;
            scheduler.process_events();
        }
        // 3 quantum cycles per arm11 cycle, 6 per arm9 cycle
        assert!((arm11_total - quantum_total / 3).abs() <= 1);
        assert!((arm9_total - quantum_total / 6).abs() <= 1);
        assert_eq!(scheduler.quantum_count(), quantum_total);
    }

    #[test]
    fn events_fire_in_deadline_order() {
        let mut scheduler = Scheduler::new();
        scheduler.add_event(EventKind::VBlankEnd, 500, ClockDomain::Arm11, 2);
        scheduler.add_event(EventKind::VBlankStart, 100, ClockDomain::Arm11, 1);

        let mut fired = Vec::new();
        for _ in 0..10 {
            scheduler.calculate_cycles_to_run();
            for (kind, param) in scheduler.process_events() {
                fired.push((kind, param));
            }
        }
        assert_eq!(fired, vec![(EventKind::VBlankStart, 1), (EventKind::VBlankEnd, 2)]);
    }
}
