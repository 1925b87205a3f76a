#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use pool_hater::{AllocatorOp, Evaluator, HeapSubject};
use quad_pool::PoolConfig;

const LEVELS: usize = 4;

#[derive(Clone, Debug, Arbitrary)]
struct Args {
    n_max: u8,
    ops: Vec<AllocatorOp>,
}

fuzz_target!(|args: Args| {
    let config = PoolConfig::new(4096, usize::from(args.n_max % 16));

    let subject = match HeapSubject::<LEVELS>::new(config) {
        Ok(s) => s,
        Err(_) => return,
    };

    Evaluator::new(subject).evaluate(args.ops).unwrap();
});
