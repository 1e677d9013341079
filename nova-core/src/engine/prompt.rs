//! System instruction assembly for live sessions.

/// Prefix marking one remembered fact in the instruction.
pub const MEMORY_PREFIX: &str = "[memory] ";

const MEMORY_HEADER: &str = "Facts the user asked you to remember:";

/// Append memory facts to the persona instruction, one per line.
///
/// Blank facts are skipped. With no usable facts the base is returned trimmed.
pub fn build_system_instruction(base: &str, memories: &[String]) -> String {
    let base = base.trim();
    let facts: Vec<&str> = memories
        .iter()
        .map(|m| m.trim())
        .filter(|m| !m.is_empty())
        .collect();
    if facts.is_empty() {
        return base.to_owned();
    }

    let mut out = String::with_capacity(base.len() + facts.iter().map(|f| f.len() + 12).sum::<usize>());
    out.push_str(base);
    out.push_str("\n\n");
    out.push_str(MEMORY_HEADER);
    for fact in facts {
        out.push('\n');
        out.push_str(MEMORY_PREFIX);
        // Keep each fact on exactly one line.
        out.push_str(&fact.replace(['\n', '\r'], " "));
    }
    out
}
