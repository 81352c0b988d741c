//! The buffer lines one assistant reply occupies.
//!
//! A region is only trusted while the buffer still holds exactly what the
//! engine last wrote there. Every write first compares those lines with the
//! buffer; any difference means the user got there first.

use crate::host::{BufferId, EditorHost};
use crate::session::InterruptReason;

/// The lines a session owns, as last written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub buffer: BufferId,
    /// Index of the region's first line
    pub start: usize,
    written: Vec<String>,
}

/// Result of comparing a region against the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionCheck {
    Intact,
    Interrupted(InterruptReason),
    /// The buffer is no longer loaded
    Gone,
}

/// Result of one write attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteStep {
    Written,
    Interrupted(InterruptReason),
    BufferClosed,
    Failed(String),
}

impl Region {
    /// A region whose first line already holds `first`
    pub fn new(buffer: BufferId, start: usize, first: String) -> Self {
        Self {
            buffer,
            start,
            written: vec![first],
        }
    }

    /// Number of lines occupied
    pub fn occupied(&self) -> usize {
        self.written.len()
    }

    /// Index of the first line after the region
    pub fn end(&self) -> usize {
        self.start + self.written.len()
    }

    /// Compare the buffer with what was last written
    pub fn check(&self, host: &dyn EditorHost) -> RegionCheck {
        if !host.is_loaded(self.buffer) {
            return RegionCheck::Gone;
        }
        if host.current_buffer() == self.buffer && host.mode().is_text_entry() {
            return RegionCheck::Interrupted(InterruptReason::EditingMode);
        }
        match host.get_lines(self.buffer, self.start..self.end()) {
            Ok(current) if current == self.written => RegionCheck::Intact,
            Ok(_) => RegionCheck::Interrupted(InterruptReason::RegionEdited),
            Err(_) if !host.is_loaded(self.buffer) => RegionCheck::Gone,
            Err(_) => RegionCheck::Interrupted(InterruptReason::RegionEdited),
        }
    }

    /// Replace the region with `lines` if it is still intact, growing or
    /// shrinking the buffer as needed.
    pub fn write(&mut self, host: &mut dyn EditorHost, lines: Vec<String>) -> WriteStep {
        match self.check(host) {
            RegionCheck::Intact => {}
            RegionCheck::Interrupted(reason) => return WriteStep::Interrupted(reason),
            RegionCheck::Gone => return WriteStep::BufferClosed,
        }
        if lines == self.written {
            return WriteStep::Written;
        }
        match host.set_lines(self.buffer, self.start..self.end(), lines.clone()) {
            Ok(()) => {
                self.written = lines;
                WriteStep::Written
            }
            Err(_) if !host.is_loaded(self.buffer) => WriteStep::BufferClosed,
            Err(e) => WriteStep::Failed(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::EditorMode;
    use crate::memory::MemoryHost;

    fn lines(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn setup() -> (MemoryHost, BufferId, Region) {
        let mut host = MemoryHost::new();
        let buf = host.open_buffer(lines(&["> hi", "LLM: ", "after"]));
        let region = Region::new(buf, 1, "LLM: ".into());
        (host, buf, region)
    }

    #[test]
    fn test_write_grows_and_shrinks() {
        let (mut host, buf, mut region) = setup();

        assert_eq!(region.write(&mut host, lines(&["LLM: one", "two"])), WriteStep::Written);
        assert_eq!(region.occupied(), 2);
        assert_eq!(
            host.lines(buf).unwrap(),
            lines(&["> hi", "LLM: one", "two", "after"]).as_slice()
        );

        assert_eq!(region.write(&mut host, lines(&["LLM: done"])), WriteStep::Written);
        assert_eq!(region.end(), 2);
        assert_eq!(
            host.lines(buf).unwrap(),
            lines(&["> hi", "LLM: done", "after"]).as_slice()
        );
    }

    #[test]
    fn test_edit_inside_region_interrupts() {
        let (mut host, buf, mut region) = setup();
        region.write(&mut host, lines(&["LLM: Hel"]));
        host.lines_mut(buf).unwrap()[1] = "LLM: Help me".into();

        assert_eq!(
            region.write(&mut host, lines(&["LLM: Hello"])),
            WriteStep::Interrupted(InterruptReason::RegionEdited)
        );
        assert_eq!(host.lines(buf).unwrap()[1], "LLM: Help me");
    }

    #[test]
    fn test_line_inserted_above_shifts_region() {
        let (mut host, buf, region) = setup();
        host.lines_mut(buf).unwrap().insert(0, "new".into());
        assert_eq!(
            region.check(&host),
            RegionCheck::Interrupted(InterruptReason::RegionEdited)
        );
    }

    #[test]
    fn test_insert_mode_interrupts_only_in_target_buffer() {
        let (mut host, _buf, region) = setup();
        host.set_mode(EditorMode::Insert);
        assert_eq!(
            region.check(&host),
            RegionCheck::Interrupted(InterruptReason::EditingMode)
        );

        host.open_buffer(lines(&["other"]));
        assert_eq!(region.check(&host), RegionCheck::Intact);
    }

    #[test]
    fn test_closed_buffer() {
        let (mut host, buf, mut region) = setup();
        host.close_buffer(buf);
        assert_eq!(region.check(&host), RegionCheck::Gone);
        assert_eq!(region.write(&mut host, lines(&["LLM: x"])), WriteStep::BufferClosed);
    }

    #[test]
    fn test_truncated_buffer_is_an_edit() {
        let (mut host, buf, mut region) = setup();
        region.write(&mut host, lines(&["LLM: a", "b"]));
        host.lines_mut(buf).unwrap().truncate(2);
        assert_eq!(
            region.check(&host),
            RegionCheck::Interrupted(InterruptReason::RegionEdited)
        );
    }
}
