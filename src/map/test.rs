use proptest::prelude::*;

use super::{Lookup, RecipeMap, Status};
use crate::host::{FnBounds, Host};
use crate::recipe::{RaLoc, SpLoc};
use crate::Config;

fn config() -> Config {
    Config { arena_bytes: 4 << 20, spin_limit: 100_000, troll_words: 64 }
}

struct TestHost {
    fns: Vec<FnBounds>,
}

impl Host for TestHost {
    fn enclosing_bounds(&self, pc: usize) -> Option<FnBounds> {
        self.fns.iter().copied().find(|b| b.start <= pc && pc < b.end)
    }

    fn in_outermost_frame(&self, _pc: usize) -> bool {
        false
    }

    fn stack_bottom(&self) -> usize {
        usize::MAX
    }
}

fn span(buf: &[u8]) -> (usize, usize) {
    let s = buf.as_ptr() as usize;
    (s, s + buf.len())
}

#[test]
fn test_initial_partition() {
    let map = RecipeMap::new(&config()).unwrap();
    assert_eq!(map.ranges(), vec![(0, usize::MAX, Status::Never)]);
}

#[test]
fn test_map_then_unmap_restores_partition() {
    let map = RecipeMap::new(&config()).unwrap();
    map.notify_map(0x1000, 0x2000);
    assert_eq!(
        map.ranges(),
        vec![(0, 0x1000, Status::Never), (0x2000, usize::MAX, Status::Never)]
    );
    map.notify_unmap(0x1000, 0x2000);
    assert_eq!(map.ranges(), vec![(0, usize::MAX, Status::Never)]);
}

#[test]
fn test_lookup_in_poisoned_range() {
    let map = RecipeMap::new(&config()).unwrap();
    let host = TestHost { fns: vec![] };
    assert!(matches!(map.lookup(0x4242, &host), Lookup::Poisoned));
}

#[test]
fn test_lookup_builds_lazily_and_is_idempotent() {
    let code = [0x90u8, 0xc3]; // nop; ret
    let (s, e) = span(&code);
    let map = RecipeMap::new(&config()).unwrap();
    let host = TestHost { fns: vec![FnBounds { start: s, end: e, load_module: 7 }] };

    map.notify_map(s, e);
    let first = map.lookup(s, &host);
    let Lookup::Ready { interval, fn_start, fn_end, load_module } = first else {
        panic!("expected Ready, got {first:?}");
    };
    assert_eq!((fn_start, fn_end, load_module), (s, e, 7));
    assert_eq!(interval.recipe.sp, SpLoc::SpRel(8));
    assert_eq!(interval.recipe.ra, RaLoc::SpRel(0));

    // Second probe sees the published record unchanged.
    let Lookup::Ready { interval: again, .. } = map.lookup(s, &host) else {
        panic!("lookup lost the record");
    };
    assert_eq!(interval, again);

    let ranges = map.ranges();
    assert!(ranges.contains(&(s, e, Status::Ready)));
}

#[test]
fn test_lookup_without_bounds_is_not_found() {
    let map = RecipeMap::new(&config()).unwrap();
    let host = TestHost { fns: vec![] };
    map.notify_map(0x7000, 0x8000);
    assert!(matches!(map.lookup(0x7800, &host), Lookup::NotFound));
    // No record was inserted for the failed probe.
    assert_eq!(
        map.ranges(),
        vec![(0, 0x7000, Status::Never), (0x8000, usize::MAX, Status::Never)]
    );
}

#[test]
fn test_empty_function_is_rejected() {
    let map = RecipeMap::new(&config()).unwrap();
    let host = TestHost { fns: vec![FnBounds { start: 0x7800, end: 0x7800, load_module: 1 }] };
    map.notify_map(0x7000, 0x8000);
    assert!(matches!(map.lookup(0x7800, &host), Lookup::NotFound));
}

#[test]
fn test_unmap_evicts_and_repoisons() {
    let code = [0x90u8, 0xc3];
    let (s, e) = span(&code);
    let map = RecipeMap::new(&config()).unwrap();
    let host = TestHost { fns: vec![FnBounds { start: s, end: e, load_module: 1 }] };

    map.notify_map(s, e);
    assert!(map.lookup(s, &host).is_ready());
    map.notify_unmap(s, e);
    assert_eq!(map.ranges(), vec![(0, usize::MAX, Status::Never)]);
    assert!(matches!(map.lookup(s, &host), Lookup::Poisoned));
}

#[test]
fn test_unmap_then_map_discards_records() {
    let code = [0x90u8, 0xc3];
    let (s, e) = span(&code);
    let map = RecipeMap::new(&config()).unwrap();
    let host = TestHost { fns: vec![FnBounds { start: s, end: e, load_module: 1 }] };

    map.notify_map(s, e);
    assert!(map.lookup(s, &host).is_ready());
    map.notify_unmap(s, e);
    map.notify_map(s, e);
    assert_eq!(
        map.ranges(),
        vec![(0, s, Status::Never), (e, usize::MAX, Status::Never)]
    );
    // The function rebuilds on demand.
    assert!(map.lookup(s, &host).is_ready());
}

#[test]
fn test_last_byte_and_one_past_end() {
    // Two adjacent functions in one mapped region.
    let code = [0x90u8, 0xc3, 0x90, 0xc3];
    let (s, e) = span(&code);
    let mid = s + 2;
    let map = RecipeMap::new(&config()).unwrap();
    let host = TestHost {
        fns: vec![
            FnBounds { start: s, end: mid, load_module: 1 },
            FnBounds { start: mid, end: e, load_module: 1 },
        ],
    };
    map.notify_map(s, e);

    let Lookup::Ready { interval, fn_end, .. } = map.lookup(mid - 1, &host) else {
        panic!("last byte must resolve");
    };
    assert_eq!(fn_end, mid);
    assert_eq!(interval.end, mid);

    // One past the end lands in the next function.
    let Lookup::Ready { fn_start, .. } = map.lookup(mid, &host) else {
        panic!("next function must resolve");
    };
    assert_eq!(fn_start, mid);
}

#[test]
fn test_lost_insert_race_is_tolerated() {
    // Two probes of the same function from one thread exercise the
    // re-lookup path; the record is inserted exactly once.
    let code = [0x90u8, 0xc3];
    let (s, e) = span(&code);
    let map = RecipeMap::new(&config()).unwrap();
    let host = TestHost { fns: vec![FnBounds { start: s, end: e, load_module: 1 }] };
    map.notify_map(s, e);
    assert!(map.lookup(s, &host).is_ready());
    assert!(map.lookup(s + 1, &host).is_ready());
    let live: Vec<_> =
        map.ranges().into_iter().filter(|r| r.2 != Status::Never).collect();
    assert_eq!(live, vec![(s, e, Status::Ready)]);
}

#[test]
fn test_concurrent_lookups_build_once() {
    let code = [0x90u8, 0xc3];
    let (s, e) = span(&code);
    let map = RecipeMap::new(&config()).unwrap();
    let host = TestHost { fns: vec![FnBounds { start: s, end: e, load_module: 1 }] };
    map.notify_map(s, e);

    // Everyone races the first touch; exactly one thread may win the
    // build, and every probe must come back READY.
    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                for pc in [s, s + 1] {
                    assert!(map.lookup(pc, &host).is_ready());
                }
            });
        }
    });

    let live: Vec<_> =
        map.ranges().into_iter().filter(|r| r.2 != Status::Never).collect();
    assert_eq!(live, vec![(s, e, Status::Ready)]);
}

#[test]
fn test_lookup_races_unmap() {
    // Readers hammer a function while another thread maps and unmaps its
    // region. Every probe must return a coherent verdict (an interval a
    // reader copied stays valid regardless of eviction), and the map must
    // stay structurally sound throughout.
    let code = [0x90u8, 0xc3];
    let (s, e) = span(&code);
    let map = RecipeMap::new(&config()).unwrap();
    let host = TestHost { fns: vec![FnBounds { start: s, end: e, load_module: 1 }] };

    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                for _ in 0..200 {
                    if let Lookup::Ready { interval, .. } = map.lookup(s, &host) {
                        assert!(interval.contains(s));
                    }
                }
            });
        }
        scope.spawn(|| {
            for _ in 0..50 {
                map.notify_map(s, e);
                map.notify_unmap(s, e);
            }
        });
    });

    let ranges = map.ranges();
    assert_eq!(ranges.first().unwrap().0, 0);
    assert_eq!(ranges.last().unwrap().1, usize::MAX);
    for w in ranges.windows(2) {
        assert!(w[0].1 <= w[1].0, "overlapping records: {ranges:?}");
    }
}

proptest! {
    /// Any sequence of map/unmap notifications keeps the poisoned records
    /// exactly equal to the complement of the mapped regions.
    #[test]
    fn prop_partition_preserved(ops in proptest::collection::vec(0..6usize, 1..40)) {
        let map = RecipeMap::new(&config()).unwrap();
        let mut mapped = [false; 6];
        let region = |i: usize| {
            let s = 0x1000_0000 + i * 0x10_0000;
            (s, s + 0x8_0000)
        };
        for &i in &ops {
            let (s, e) = region(i);
            if mapped[i] {
                map.notify_unmap(s, e);
            } else {
                map.notify_map(s, e);
            }
            mapped[i] = !mapped[i];

            let mut expect = Vec::new();
            let mut cur = 0usize;
            for (j, on) in mapped.iter().enumerate() {
                if *on {
                    let (s, e) = region(j);
                    expect.push((cur, s, Status::Never));
                    cur = e;
                }
            }
            expect.push((cur, usize::MAX, Status::Never));
            prop_assert_eq!(map.ranges(), expect);
        }
    }
}
