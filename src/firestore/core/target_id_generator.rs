/// Hands out target ids in one residue class so ids allocated by the target
/// cache (even) never collide with limbo ids allocated by the sync engine (odd).
#[derive(Clone, Debug)]
pub struct TargetIdGenerator {
    last_id: i32,
}

const RESERVED_BITS: i32 = 2;

impl TargetIdGenerator {
    pub fn for_target_cache(highest_target_id: i32) -> Self {
        Self {
            last_id: highest_target_id.max(0),
        }
    }

    pub fn for_sync_engine() -> Self {
        Self {
            last_id: 1 - RESERVED_BITS,
        }
    }

    pub fn next_id(&mut self) -> i32 {
        self.last_id += RESERVED_BITS;
        self.last_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generators_do_not_overlap() {
        let mut cache = TargetIdGenerator::for_target_cache(0);
        let mut sync = TargetIdGenerator::for_sync_engine();
        assert_eq!([cache.next_id(), cache.next_id()], [2, 4]);
        assert_eq!([sync.next_id(), sync.next_id()], [1, 3]);
    }

    #[test]
    fn cache_generator_resumes_after_highest_id() {
        let mut cache = TargetIdGenerator::for_target_cache(8);
        assert_eq!(cache.next_id(), 10);
    }
}
