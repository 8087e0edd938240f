use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// Kinds of identifiers handed out by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    Session,
    Message,
    Part,
    Permission,
    Event,
}

impl IdKind {
    fn prefix(self) -> &'static str {
        match self {
            IdKind::Session => "ses",
            IdKind::Message => "msg",
            IdKind::Part => "prt",
            IdKind::Permission => "per",
            IdKind::Event => "evt",
        }
    }
}

/// Mints monotonic ascending opaque identifiers.
///
/// All kinds draw from one shared counter, so an id issued later always
/// carries a larger sequence number than any id issued earlier, including
/// across kinds. Within a fixed kind the zero-padded decimal tail makes the
/// ids sort lexicographically in issue order, which part ordering relies on.
#[derive(Debug, Default)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, kind: IdKind) -> String {
        let seq = self.next.fetch_add(1, Ordering::SeqCst);
        format!("{}_{seq:012}", kind.prefix())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_ascend_within_a_kind() {
        let ids = IdGenerator::new();
        let a = ids.next(IdKind::Part);
        let b = ids.next(IdKind::Part);
        let c = ids.next(IdKind::Part);
        assert!(a < b && b < c);
    }

    #[test]
    fn shared_counter_spans_kinds() {
        let ids = IdGenerator::new();
        let session = ids.next(IdKind::Session);
        let part = ids.next(IdKind::Part);
        assert_eq!(session, "ses_000000000000");
        assert_eq!(part, "prt_000000000001");
    }

    #[test]
    fn concurrent_minting_never_collides() {
        use std::sync::Arc;

        let ids = Arc::new(IdGenerator::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let ids = Arc::clone(&ids);
            handles.push(std::thread::spawn(move || {
                (0..100).map(|_| ids.next(IdKind::Part)).collect::<Vec<_>>()
            }));
        }
        let mut all: Vec<String> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap_or_default())
            .collect();
        let before = all.len();
        all.sort();
        all.dedup();
        assert_eq!(before, all.len());
    }
}
