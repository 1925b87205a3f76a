#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use pool_hater::{AllocatorOp, Evaluator, PoolSubject};
use quad_pool::PoolConfig;

const LEVELS: usize = 6;

// Sizes are counted in words so that every level stays at least one word.
const MIN_WORDS: usize = 1 << (2 * (LEVELS - 1));

#[derive(Clone, Debug, Arbitrary)]
struct Args {
    n_max: u8,
    scale: u8,
    ops: Vec<AllocatorOp>,
}

fuzz_target!(|args: Args| {
    let words = MIN_WORDS + usize::from(args.scale);
    let max_block_size = words * core::mem::size_of::<usize>();
    let config = PoolConfig::new(max_block_size, usize::from(args.n_max));

    let subject = match PoolSubject::<LEVELS>::new(config) {
        Ok(s) => s,
        Err(_) => return,
    };

    Evaluator::new(subject).evaluate(args.ops).unwrap();
});
