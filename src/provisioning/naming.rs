/// Hostname-safe VM name for a student's course machine.
///
/// Spaces in the course name become `-`, the result is lower-cased and
/// anything outside `[a-z0-9-]` is dropped, so `("Intro to CS", "bob.smith")`
/// gives `intro-to-cs-bobsmith`.
pub fn derive_vm_name(course_name: &str, username: &str) -> String {
    format!("{}-{}", course_name.replace(' ', "-"), username)
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-')
        .collect()
}
