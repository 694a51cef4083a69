//! A reusable phase barrier, used between the build and probe stages of a
//! join/partition thread group and again between probe end and teardown.

use parking_lot::{Condvar, Mutex};

struct State {
    arrived: usize,
    generation: u64,
}

/// Arrive-and-wait barrier with arity fixed at construction. Unlike a
/// single-use barrier, it can be reused across phases: a "generation"
/// counter distinguishes the current round from the next so a thread that
/// arrives early for round N+1 waits correctly rather than racing with
/// stragglers still leaving round N.
pub struct Barrier {
    arity: usize,
    state: Mutex<State>,
    cv: Condvar,
}

impl Barrier {
    pub fn new(arity: usize) -> Self {
        assert!(arity > 0, "barrier arity must be positive");
        Self { arity, state: Mutex::new(State { arrived: 0, generation: 0 }), cv: Condvar::new() }
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    /// Block until `arity` callers have arrived at this generation, then
    /// release all of them together.
    pub fn arrive_and_wait(&self) {
        let mut state = self.state.lock();
        let my_generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.arity {
            state.arrived = 0;
            state.generation += 1;
            self.cv.notify_all();
        } else {
            while state.generation == my_generation {
                self.cv.wait(&mut state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn releases_all_waiters_once_arity_reached() {
        let barrier = Arc::new(Barrier::new(4));
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];
        for _ in 0..4 {
            let b = Arc::clone(&barrier);
            let c = Arc::clone(&counter);
            handles.push(std::thread::spawn(move || {
                c.fetch_add(1, Ordering::SeqCst);
                b.arrive_and_wait();
                // By the time every thread resumes, all must have incremented.
                assert_eq!(c.load(Ordering::SeqCst), 4);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn is_reusable_across_phases() {
        let barrier = Arc::new(Barrier::new(2));
        for _round in 0..3 {
            let b = Arc::clone(&barrier);
            let t = std::thread::spawn(move || b.arrive_and_wait());
            barrier.arrive_and_wait();
            t.join().unwrap();
        }
    }
}
