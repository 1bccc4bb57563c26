use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

static ENABLED: AtomicBool = AtomicBool::new(false);

/// Turns profiling on or off for profiles created afterwards.
pub fn set_profiling(enabled: bool) {
    ENABLED.store(enabled, Ordering::SeqCst);
}

pub fn profiling_enabled() -> bool {
    ENABLED.load(Ordering::SeqCst)
}

/// A finished node of the timing tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProfileNode {
    pub name: String,
    pub duration: Duration,
    pub samples: u64,
    pub children: Vec<ProfileNode>,
}

impl ProfileNode {
    pub fn child(&self, name: &str) -> Option<&ProfileNode> {
        self.children.iter().find(|c| c.name == name)
    }
}

struct Slot {
    name: String,
    duration: Duration,
    samples: u64,
    children: Vec<usize>,
}

struct Tree {
    slots: Vec<Slot>,
    stack: Vec<(usize, Instant)>,
}

impl Tree {
    fn child_of(&mut self, parent: usize, name: &str) -> usize {
        if let Some(&i) = self.slots[parent]
            .children
            .iter()
            .find(|&&i| self.slots[i].name == name)
        {
            return i;
        }
        let i = self.slots.len();
        self.slots.push(Slot {
            name: name.to_string(),
            duration: Duration::ZERO,
            samples: 0,
            children: Vec::new(),
        });
        self.slots[parent].children.push(i);
        i
    }

    fn top(&self) -> usize {
        self.stack.last().map_or(0, |(i, _)| *i)
    }

    fn node(&self, i: usize) -> ProfileNode {
        let s = &self.slots[i];
        ProfileNode {
            name: s.name.clone(),
            duration: s.duration,
            samples: s.samples,
            children: s.children.iter().map(|&c| self.node(c)).collect(),
        }
    }
}

/// A hierarchical timing tree with a current stack.
pub struct Profile {
    enabled: bool,
    tree: Mutex<Tree>,
}

/// Pops its profile frame when dropped.
#[must_use = "the frame is popped when the guard is dropped"]
pub struct ProfileGuard<'a> {
    profile: &'a Profile,
}

impl Drop for ProfileGuard<'_> {
    fn drop(&mut self) {
        self.profile.pop();
    }
}

impl Profile {
    /// A profile that records only if profiling is globally enabled.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_enabled(name, profiling_enabled())
    }

    pub fn disabled() -> Self {
        Self::with_enabled("", false)
    }

    pub fn with_enabled(name: impl Into<String>, enabled: bool) -> Self {
        Self {
            enabled,
            tree: Mutex::new(Tree {
                slots: vec![Slot {
                    name: name.into(),
                    duration: Duration::ZERO,
                    samples: 0,
                    children: Vec::new(),
                }],
                stack: Vec::new(),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn lock(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Descends into the child `name`, starting its clock.
    pub fn push(&self, name: &str) -> ProfileGuard<'_> {
        if self.enabled {
            let mut t = self.lock();
            let parent = t.top();
            let i = t.child_of(parent, name);
            t.stack.push((i, Instant::now()));
        }
        ProfileGuard { profile: self }
    }

    /// Stops the clock of the current frame and returns to its parent.
    pub fn pop(&self) {
        if !self.enabled {
            return;
        }
        let mut t = self.lock();
        if let Some((i, start)) = t.stack.pop() {
            let slot = &mut t.slots[i];
            slot.duration += start.elapsed();
            slot.samples += 1;
        }
    }

    /// Records `dur` against the child `name` of the current frame.
    pub fn sample(&self, name: &str, dur: Duration) {
        if !self.enabled {
            return;
        }
        let mut t = self.lock();
        let parent = t.top();
        let i = t.child_of(parent, name);
        let slot = &mut t.slots[i];
        slot.duration += dur;
        slot.samples += 1;
    }

    /// Runs `f` inside a frame called `name`.
    pub fn time<T>(&self, name: &str, f: impl FnOnce() -> T) -> T {
        let _frame = self.push(name);
        f()
    }

    pub fn snapshot(&self) -> ProfileNode {
        self.lock().node(0)
    }

    /// Writes one line per node, indented with `indent` per level.
    pub fn fprint(&self, w: &mut dyn fmt::Write, indent: &str) -> fmt::Result {
        fn walk(w: &mut dyn fmt::Write, n: &ProfileNode, indent: &str, depth: usize) -> fmt::Result {
            write!(w, "{}{}: {}", indent.repeat(depth), n.name, fmt_duration(n.duration))?;
            if n.samples >= 2 {
                write!(w, "*{}", n.samples)?;
            }
            writeln!(w)?;
            n.children
                .iter()
                .try_for_each(|c| walk(w, c, indent, depth + 1))
        }
        walk(w, &self.snapshot(), indent, 0)
    }
}

impl fmt::Debug for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Profile")
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

/// Formats a duration with granularity depending on its magnitude:
/// microseconds below 1ms, milliseconds below a minute, seconds above.
pub fn fmt_duration(d: Duration) -> String {
    if d.is_zero() {
        return "0s".to_string();
    }
    if d < Duration::from_millis(1) {
        let us = (d.as_nanos() + 500) / 1_000;
        return format!("{us}µs");
    }
    if d < Duration::from_secs(60) {
        let ms = (d.as_micros() + 500) / 1_000;
        if ms < 1_000 {
            return format!("{ms}ms");
        }
        let secs = format!("{}.{:03}", ms / 1_000, ms % 1_000);
        let secs = secs.trim_end_matches('0').trim_end_matches('.');
        return format!("{secs}s");
    }
    let total = (d.as_millis() + 500) / 1_000;
    let (h, m, s) = (total / 3_600, (total % 3_600) / 60, total % 60);
    if h > 0 {
        format!("{h}h{m}m{s}s")
    } else {
        format!("{m}m{s}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn push_pop_builds_a_tree() {
        let p = Profile::with_enabled("agent", true);
        for _ in 0..2 {
            let _a = p.push("reduce");
            let _b = p.push("import");
        }
        p.sample("parse", Duration::from_millis(3));

        let root = p.snapshot();
        let reduce = root.child("reduce").expect("reduce");
        assert_eq!(reduce.samples, 2);
        assert_eq!(reduce.child("import").expect("import").samples, 2);
        assert_eq!(root.child("parse").expect("parse").duration, Duration::from_millis(3));
    }

    #[test]
    fn disabled_profiles_record_nothing() {
        let p = Profile::disabled();
        p.time("work", || ());
        p.sample("x", Duration::from_secs(1));
        assert!(p.snapshot().children.is_empty());
    }

    #[test]
    fn durations_are_formatted_by_magnitude() {
        assert_eq!(fmt_duration(Duration::from_nanos(1_499)), "1µs");
        assert_eq!(fmt_duration(Duration::from_micros(999)), "999µs");
        assert_eq!(fmt_duration(Duration::from_micros(12_600)), "13ms");
        assert_eq!(fmt_duration(Duration::from_millis(1_250)), "1.25s");
        assert_eq!(fmt_duration(Duration::from_secs(2)), "2s");
        assert_eq!(fmt_duration(Duration::from_secs(125)), "2m5s");
        assert_eq!(fmt_duration(Duration::from_secs(3_725)), "1h2m5s");
    }

    #[test]
    fn fprint_marks_repeated_samples() {
        let p = Profile::with_enabled("root", true);
        p.sample("once", Duration::from_millis(2));
        p.sample("twice", Duration::from_millis(1));
        p.sample("twice", Duration::from_millis(1));
        let mut out = String::new();
        p.fprint(&mut out, "\t").unwrap();
        assert_eq!(out, "root: 0s\n\tonce: 2ms\n\ttwice: 2ms*2\n");
    }
}
