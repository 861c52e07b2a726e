//! Prog generation.

use crate::{
    prog::{Arg, Call, Prog},
    select::ChoiceTable,
    syscall::{Field, ResKind},
    target::Target,
    HashMap, RngType,
};
use rand::{prelude::SliceRandom, Rng};

pub const MIN_PROG_LEN: usize = 2;
pub const MAX_PROG_LEN: usize = 12;

/// Integer values that are disproportionately interesting to kernels.
const SPECIAL_INTS: [u64; 12] = [
    0,
    1,
    2,
    3,
    8,
    64,
    4096,
    0x7fff_ffff,
    0x8000_0000,
    0xffff_ffff,
    u64::MAX,
    1 << 20,
];

const MAX_BUFFER_LEN: usize = 64;

/// Generate a fresh prog from the choice table.
pub fn gen(target: &Target, ct: &ChoiceTable, rng: &mut RngType) -> Prog {
    let len = rng.gen_range(MIN_PROG_LEN..=MAX_PROG_LEN);
    let mut ctx = GenContext::default();
    let mut calls = Vec::with_capacity(len);
    while calls.len() < len {
        calls.push(gen_call(target, ct, &mut ctx, rng, calls.len()));
    }
    Prog::new(calls)
}

/// Generate one call and record any resource it produces.
pub fn gen_call(
    target: &Target,
    ct: &ChoiceTable,
    ctx: &mut GenContext,
    rng: &mut RngType,
    index: usize,
) -> Call {
    let sid = ct.select(rng);
    let syscall = target.syscall_of(sid);
    let args = syscall
        .fields()
        .iter()
        .map(|field| gen_arg(field, ctx, rng))
        .collect();
    if let Some(kind) = syscall.ret() {
        ctx.produced.entry(kind).or_default().push(index);
    }
    Call::new(sid, args)
}

pub fn gen_arg(field: &Field, ctx: &GenContext, rng: &mut RngType) -> Arg {
    match field {
        Field::Scalar => Arg::Const(gen_int(rng)),
        Field::Buffer => Arg::Data(gen_buffer(rng)),
        Field::ResUse(kind) => gen_res(*kind, ctx, rng),
    }
}

pub fn gen_int(rng: &mut RngType) -> u64 {
    if rng.gen_ratio(3, 4) {
        *SPECIAL_INTS.choose(rng).unwrap()
    } else {
        rng.gen()
    }
}

fn gen_buffer(rng: &mut RngType) -> Vec<u8> {
    let len = rng.gen_range(0..=MAX_BUFFER_LEN);
    (0..len).map(|_| rng.gen()).collect()
}

fn gen_res(kind: ResKind, ctx: &GenContext, rng: &mut RngType) -> Arg {
    let src = ctx
        .produced
        .get(&kind)
        .and_then(|producers| producers.choose(rng).copied());
    Arg::Res { kind, src }
}

/// Resources produced so far, by kind, as producing-call indices.
#[derive(Debug, Default)]
pub struct GenContext {
    pub produced: HashMap<ResKind, Vec<usize>>,
}

impl GenContext {
    /// Rebuild the context from an existing call prefix.
    pub fn from_calls(target: &Target, calls: &[Call]) -> Self {
        let mut ctx = GenContext::default();
        for (i, call) in calls.iter().enumerate() {
            if let Some(kind) = target.syscall_of(call.sid()).ret() {
                ctx.produced.entry(kind).or_default().push(i);
            }
        }
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{select::ChoiceTable, HashSet};
    use rand::SeedableRng;

    #[test]
    fn generated_progs_are_valid() {
        let target = Target::new("linux", "amd64").unwrap();
        let enabled: HashSet<usize> = target.build_call_set("", |_| true).unwrap();
        let ct = ChoiceTable::build(&target, &enabled, None);
        let mut rng = RngType::seed_from_u64(42);

        for _ in 0..256 {
            let p = gen(&target, &ct, &mut rng);
            assert!(p.len() >= MIN_PROG_LEN && p.len() <= MAX_PROG_LEN);
            assert!(p.validate(&target), "invalid prog:\n{}", p.display(&target));
            for call in p.calls() {
                assert!(enabled.contains(&call.sid()));
            }
        }
    }
}
