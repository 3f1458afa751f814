//! The four benchmark workloads and their CSV accounting.

use std::io::{self, Write};
use std::ptr;
use std::time::Instant;

use heaplab::{AllocatorKind, Heap};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const CSV_HEADER: &str = "Allocator,Benchmark,Time_us,Operations,Ops_per_sec";

const BENCH_HEAP_SIZE: usize = 10 * 1024 * 1024;
const RANDOM_SEED: u64 = 42;
const MAX_LIVE: usize = 1000;
const STRESS_CAP: usize = 10_000;

pub fn csv_name(kind: AllocatorKind) -> &'static str {
    match kind {
        AllocatorKind::Segregated => "SegregatedFreeList",
        AllocatorKind::McKusick => "McKusickKarels",
    }
}

struct Sample {
    benchmark: &'static str,
    elapsed_us: f64,
    operations: usize,
}

impl Sample {
    fn ops_per_sec(&self) -> f64 {
        self.operations as f64 / (self.elapsed_us / 1_000_000.0)
    }
}

fn elapsed_us(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1_000_000.0
}

/// Runs the four workloads for `kind`, each on a fresh 10 MiB heap, and
/// appends one CSV row per workload to `out`.
pub fn run_all(kind: AllocatorKind, num_ops: usize, out: &mut dyn Write) -> io::Result<()> {
    let name = csv_name(kind);
    log::info!("running benchmarks for {name}");

    let workloads: [fn(&mut Heap, usize) -> Sample; 4] = [sequential, random, mixed, stress];
    for workload in workloads {
        let mut heap = match Heap::new(kind, BENCH_HEAP_SIZE) {
            Ok(heap) => heap,
            Err(err) => {
                log::error!("failed to create {name} heap: {err}");
                return Ok(());
            }
        };
        let sample = workload(&mut heap, num_ops);
        writeln!(
            out,
            "{},{},{:.2},{},{:.2}",
            name,
            sample.benchmark,
            sample.elapsed_us,
            sample.operations,
            sample.ops_per_sec(),
        )?;
    }
    Ok(())
}

/// Back-to-back allocate/free of one 64-byte block, `num_ops / 2` times.
fn sequential(heap: &mut Heap, num_ops: usize) -> Sample {
    let rounds = num_ops / 2;
    let start = Instant::now();

    for _ in 0..rounds {
        let ptr = heap.alloc(64);
        if !ptr.is_null() {
            unsafe { heap.free(ptr) };
        }
    }

    Sample {
        benchmark: "Sequential",
        elapsed_us: elapsed_us(start),
        operations: rounds,
    }
}

/// Seeded coin-flip between allocating a random 16..1039 byte block (up
/// to 1000 live) and freeing a random live one, then a full drain.
fn random(heap: &mut Heap, num_ops: usize) -> Sample {
    let mut rng = StdRng::seed_from_u64(RANDOM_SEED);
    let mut live: Vec<*mut u8> = Vec::with_capacity(MAX_LIVE);
    let start = Instant::now();

    for _ in 0..num_ops {
        if rng.gen_range(0..2) == 0 && live.len() < MAX_LIVE {
            let size = 16 + rng.gen_range(0..1024);
            let ptr = heap.alloc(size);
            if !ptr.is_null() {
                live.push(ptr);
            }
        } else if !live.is_empty() {
            let idx = rng.gen_range(0..live.len());
            unsafe { heap.free(live.swap_remove(idx)) };
        }
    }
    for ptr in live.drain(..) {
        unsafe { heap.free(ptr) };
    }

    Sample {
        benchmark: "Random",
        elapsed_us: elapsed_us(start),
        operations: num_ops,
    }
}

/// 500 small blocks, every other one freed and replaced by a larger
/// block, then everything released. Counted as 2000 operations.
fn mixed(heap: &mut Heap, _num_ops: usize) -> Sample {
    let mut slots: Vec<*mut u8> = vec![ptr::null_mut(); 500];
    let start = Instant::now();

    for slot in slots.iter_mut() {
        *slot = heap.alloc(32);
    }
    for slot in slots.iter_mut().step_by(2) {
        unsafe { heap.free(*slot) };
        *slot = ptr::null_mut();
    }
    for slot in slots.iter_mut().step_by(2) {
        *slot = heap.alloc(128);
    }
    for slot in slots.iter_mut() {
        if !slot.is_null() {
            unsafe { heap.free(*slot) };
        }
    }

    Sample {
        benchmark: "Mixed",
        elapsed_us: elapsed_us(start),
        operations: 2000,
    }
}

/// Allocates 256-byte blocks until failure or the cap, then frees every
/// success. Operations count both directions.
fn stress(heap: &mut Heap, num_ops: usize) -> Sample {
    let mut live = Vec::new();
    let start = Instant::now();

    for _ in 0..STRESS_CAP.min(num_ops) {
        let ptr = heap.alloc(256);
        if ptr.is_null() {
            break;
        }
        live.push(ptr);
    }
    let allocated = live.len();
    for ptr in live.drain(..) {
        unsafe { heap.free(ptr) };
    }

    Sample {
        benchmark: "Stress",
        elapsed_us: elapsed_us(start),
        operations: allocated * 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sweep(kind: AllocatorKind) -> Vec<String> {
        let mut out = Vec::new();
        run_all(kind, 1000, &mut out).expect("in-memory write");
        String::from_utf8(out)
            .expect("csv is utf-8")
            .lines()
            .map(str::to_owned)
            .collect()
    }

    #[test]
    fn one_row_per_workload_with_the_allocator_name() {
        let rows = sweep(AllocatorKind::McKusick);
        assert_eq!(rows.len(), 4);
        for (row, benchmark) in rows.iter().zip(["Sequential", "Random", "Mixed", "Stress"]) {
            let fields: Vec<&str> = row.split(',').collect();
            assert_eq!(fields.len(), 5, "bad row: {row}");
            assert_eq!(fields[0], "McKusickKarels");
            assert_eq!(fields[1], benchmark);
        }
    }

    #[test]
    fn operation_counts_match_the_workload_definitions() {
        let rows = sweep(AllocatorKind::Segregated);
        let ops: Vec<&str> = rows
            .iter()
            .map(|row| row.split(',').nth(3).expect("ops field"))
            .collect();
        assert_eq!(ops[0], "500"); // num_ops / 2
        assert_eq!(ops[1], "1000"); // num_ops
        assert_eq!(ops[2], "2000"); // fixed
        assert_eq!(ops[3], "2000"); // 1000 stress allocations + frees
    }
}
