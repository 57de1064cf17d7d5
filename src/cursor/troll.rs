use crate::host::Host;
use crate::map::{Lookup, RecipeMap};
use crate::probe::read_word;

const W: usize = std::mem::size_of::<usize>();

pub(crate) struct TrollHit {
    /// Stack slot the plausible return address was found in.
    pub slot: usize,
    pub ra: usize,
    pub lookup: Lookup,
}

/// Scans up the stack from `sp`, word by word, for something that looks
/// like a return address: a value whose recipe-map lookup comes back
/// `READY`. The lookup itself is the plausibility test, so a hit may build
/// intervals as a side effect.
pub(crate) fn scan(
    map: &RecipeMap,
    host: &dyn Host,
    sp: usize,
    stack_bottom: usize,
    limit_words: usize,
) -> Option<TrollHit> {
    let mut addr = (sp + W - 1) & !(W - 1);
    for _ in 0..limit_words {
        if addr >= stack_bottom {
            break;
        }
        let word = read_word(addr)?;
        // The first page never holds code; skip the lookup for small
        // integers that saturate real stacks.
        if word >= 0x1000 {
            let lookup = map.lookup(word, host);
            if lookup.is_ready() {
                return Some(TrollHit { slot: addr, ra: word, lookup });
            }
        }
        addr += W;
    }
    None
}
