//! Markup stripping for agent-submitted text.
//!
//! Removes, in order: `<script>` blocks, `<iframe>` blocks, `javascript:`
//! schemes and inline `on<event>=` handlers. The pass repeats until nothing
//! changes, so fragments that reassemble into a vector after one removal
//! (`<scr<script></script>ipt>`) are caught as well.

use regex::Regex;
use std::sync::LazyLock;

static SCRIPT_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script\b.*?</script>").expect("valid script regex"));
static IFRAME_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<iframe\b.*?</iframe>").expect("valid iframe regex"));
static JAVASCRIPT_SCHEME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)javascript:").expect("valid scheme regex"));
static EVENT_HANDLER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)on\w+\s*=").expect("valid handler regex"));

fn strip_once(text: &str) -> String {
    let out = SCRIPT_BLOCK.replace_all(text, "");
    let out = IFRAME_BLOCK.replace_all(&out, "");
    let out = JAVASCRIPT_SCHEME.replace_all(&out, "");
    EVENT_HANDLER.replace_all(&out, "").into_owned()
}

/// Strip injection vectors. Never lengthens the input and
/// `sanitize(&sanitize(x)) == sanitize(x)`.
pub fn sanitize(text: &str) -> String {
    let mut current = strip_once(text);
    loop {
        let next = strip_once(&current);
        // Each pass only deletes, so equal length means nothing matched.
        if next.len() == current.len() {
            return current;
        }
        current = next;
    }
}
