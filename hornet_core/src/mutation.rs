//! Prog mutation.

use crate::{
    gen::{gen_call, gen_int, GenContext, MAX_PROG_LEN},
    prog::{Arg, Prog},
    select::{choose_weighted, ChoiceTable},
    target::Target,
    RngType,
};
use rand::{prelude::SliceRandom, Rng};

/// Upper bound on prog growth during mutation; generation stays within
/// [`MAX_PROG_LEN`], mutation may push a little past it.
const MUTATED_MAX_LEN: usize = 2 * MAX_PROG_LEN;

const MAX_TRIES: usize = 16;

/// Cap on the number of hint-derived mutants per smash round.
pub const MAX_HINT_MUTANTS: usize = 32;

type MutateOp = fn(&Target, &ChoiceTable, &mut RngType, &mut Prog, Option<&Prog>) -> bool;

/// Mutate `p` in place. `donor` is a corpus prog used by the splice
/// strategy; mutation works without one.
pub fn mutate(
    target: &Target,
    ct: &ChoiceTable,
    rng: &mut RngType,
    p: &mut Prog,
    donor: Option<&Prog>,
) {
    const OPERATIONS: [MutateOp; 4] = [insert_call, mutate_args, remove_call, splice];
    const WEIGHTS: [u64; 4] = [40, 90, 95, 100];

    let mut mutated = false;
    let mut tries = 0;
    while tries < MAX_TRIES && (!mutated || rng.gen_ratio(1, 2)) {
        let idx = choose_weighted(rng, &WEIGHTS);
        mutated |= OPERATIONS[idx](target, ct, rng, p, donor);
        tries += 1;
    }
    debug_assert!(p.validate(target));
}

/// Insert one generated call at a random position.
fn insert_call(
    target: &Target,
    ct: &ChoiceTable,
    rng: &mut RngType,
    p: &mut Prog,
    _donor: Option<&Prog>,
) -> bool {
    if p.len() >= MUTATED_MAX_LEN {
        return false;
    }
    let pos = rng.gen_range(0..=p.len());
    let mut ctx = GenContext::from_calls(target, &p.calls()[..pos]);
    let call = gen_call(target, ct, &mut ctx, rng, pos);
    shift_res_refs(p, pos, 1);
    p.calls_mut().insert(pos, call);
    true
}

/// Tweak one argument of one call.
fn mutate_args(
    target: &Target,
    _ct: &ChoiceTable,
    rng: &mut RngType,
    p: &mut Prog,
    _donor: Option<&Prog>,
) -> bool {
    if p.is_empty() {
        return false;
    }
    let call_idx = rng.gen_range(0..p.len());
    let ctx = GenContext::from_calls(target, &p.calls()[..call_idx]);
    let call = &mut p.calls_mut()[call_idx];
    if call.args().is_empty() {
        return false;
    }
    let arg_idx = rng.gen_range(0..call.args().len());
    match &mut call.args_mut()[arg_idx] {
        Arg::Const(v) => {
            *v = if rng.gen_ratio(1, 2) {
                // flip one bit, kernels care about flags
                *v ^ (1 << rng.gen_range(0..64))
            } else {
                gen_int(rng)
            };
        }
        Arg::Data(data) => {
            if data.is_empty() || rng.gen_ratio(1, 4) {
                data.push(rng.gen());
            } else {
                let i = rng.gen_range(0..data.len());
                data[i] = data[i].wrapping_add(rng.gen_range(1..=255));
            }
        }
        Arg::Res { kind, src } => {
            *src = ctx
                .produced
                .get(kind)
                .and_then(|producers| producers.choose(rng).copied());
        }
    }
    true
}

fn remove_call(
    _target: &Target,
    _ct: &ChoiceTable,
    rng: &mut RngType,
    p: &mut Prog,
    _donor: Option<&Prog>,
) -> bool {
    if p.len() <= 1 {
        return false;
    }
    let idx = rng.gen_range(0..p.len());
    p.remove_call_inplace(idx);
    true
}

/// Insert a whole corpus prog at a random boundary.
fn splice(
    _target: &Target,
    _ct: &ChoiceTable,
    rng: &mut RngType,
    p: &mut Prog,
    donor: Option<&Prog>,
) -> bool {
    let donor = match donor {
        Some(d) if !d.is_empty() => d,
        _ => return false,
    };
    if p.len() + donor.len() > MUTATED_MAX_LEN {
        return false;
    }
    let pos = rng.gen_range(0..=p.len());
    shift_res_refs(p, pos, donor.len());
    for (i, call) in donor.calls().iter().enumerate() {
        let mut call = call.clone();
        for arg in call.args_mut() {
            if let Arg::Res { src: Some(s), .. } = arg {
                *s += pos;
            }
        }
        p.calls_mut().insert(pos + i, call);
    }
    true
}

/// Shift resource references pointing at or past `pos` by `by` slots.
fn shift_res_refs(p: &mut Prog, pos: usize, by: usize) {
    for call in p.calls_mut() {
        for arg in call.args_mut() {
            if let Arg::Res { src: Some(s), .. } = arg {
                if *s >= pos {
                    *s += by;
                }
            }
        }
    }
}

/// Derive mutants of `p` from comparison operands observed for call
/// `call_idx`: wherever a constant argument equals one operand, substitute
/// the other. Matches full values and u32 truncations.
pub fn mutate_with_hints(p: &Prog, call_idx: usize, comps: &[(u64, u64)]) -> Vec<Prog> {
    let mut mutants = Vec::new();
    let call = &p.calls()[call_idx];
    for &(op1, op2) in comps {
        if op1 == op2 {
            continue;
        }
        for (arg_idx, arg) in call.args().iter().enumerate() {
            let v = match arg {
                Arg::Const(v) => *v,
                _ => continue,
            };
            let replacement = if v == op1 {
                Some(op2)
            } else if v == op2 {
                Some(op1)
            } else if v as u32 == op1 as u32 {
                Some((v & !0xffff_ffff) | (op2 & 0xffff_ffff))
            } else {
                None
            };
            if let Some(new_v) = replacement {
                let mut mutant = p.clone();
                mutant.calls_mut()[call_idx].args_mut()[arg_idx] = Arg::Const(new_v);
                mutants.push(mutant);
                if mutants.len() >= MAX_HINT_MUTANTS {
                    return mutants;
                }
            }
        }
    }
    mutants
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        gen::gen,
        prog::{Arg, Call},
        select::ChoiceTable,
        HashSet,
    };
    use rand::SeedableRng;

    fn setup() -> (Target, ChoiceTable) {
        let target = Target::new("linux", "amd64").unwrap();
        let enabled: HashSet<usize> = target.build_call_set("", |_| true).unwrap();
        let ct = ChoiceTable::build(&target, &enabled, None);
        (target, ct)
    }

    #[test]
    fn mutate_keeps_progs_valid() {
        let (target, ct) = setup();
        let mut rng = RngType::seed_from_u64(7);
        for _ in 0..128 {
            let mut p = gen(&target, &ct, &mut rng);
            let donor = gen(&target, &ct, &mut rng);
            mutate(&target, &ct, &mut rng, &mut p, Some(&donor));
            assert!(p.validate(&target), "invalid prog:\n{}", p.display(&target));
            assert!(!p.is_empty());
        }
    }

    #[test]
    fn mutate_without_donor() {
        let (target, ct) = setup();
        let mut rng = RngType::seed_from_u64(8);
        let mut p = gen(&target, &ct, &mut rng);
        mutate(&target, &ct, &mut rng, &mut p, None);
        assert!(p.validate(&target));
    }

    #[test]
    fn hints_substitute_operands() {
        let sid = 0;
        let p = Prog::new(vec![Call::new(sid, vec![Arg::Const(0xdead), Arg::Const(5)])]);
        let mutants = mutate_with_hints(&p, 0, &[(0xdead, 0xbeef)]);
        assert_eq!(mutants.len(), 1);
        assert_eq!(mutants[0].calls()[0].args()[0], Arg::Const(0xbeef));
        // untouched args stay put
        assert_eq!(mutants[0].calls()[0].args()[1], Arg::Const(5));
    }

    #[test]
    fn hints_ignore_non_matching() {
        let p = Prog::new(vec![Call::new(0, vec![Arg::Const(1)])]);
        assert!(mutate_with_hints(&p, 0, &[(0x1234, 0x5678)]).is_empty());
        assert!(mutate_with_hints(&p, 0, &[(7, 7)]).is_empty());
    }
}
