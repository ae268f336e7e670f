//! Conversation grouping.
//!
//! A thread id is the root message identifier of the conversation. Ids already
//! stored for any member win, so a conversation keeps its id across syncs.

use super::parse::ParsedHeaders;
use crate::imap::ThreadGroup;

use std::collections::{BTreeSet, HashMap};

/// Group messages purely by `Message-ID` / `In-Reply-To` / `References` links.
///
/// `known` maps message identifiers to thread ids that are already assigned.
/// Returns the thread id for every input sequence number.
pub fn group_by_references(
    messages: &[(u32, &ParsedHeaders)],
    known: &HashMap<String, String>,
) -> HashMap<u32, String> {
    let mut ids = IdSets::default();
    for (_, headers) in messages {
        let own = ids.node(&headers.message_id);
        for parent in headers.parent_ids() {
            let parent = ids.node(parent);
            ids.union(own, parent);
        }
    }

    let mut components: HashMap<usize, Vec<&ParsedHeaders>> = HashMap::new();
    let mut members: Vec<(u32, usize)> = Vec::with_capacity(messages.len());
    for (seq, headers) in messages {
        let node = ids.node(&headers.message_id);
        let root = ids.find(node);
        components.entry(root).or_default().push(headers);
        members.push((*seq, root));
    }

    let thread_ids: HashMap<usize, String> = components
        .into_iter()
        .map(|(root, group)| (root, thread_id_for(&group, known)))
        .collect();

    members
        .into_iter()
        .filter_map(|(seq, root)| thread_ids.get(&root).map(|id| (seq, id.clone())))
        .collect()
}

/// Turn server-computed THREAD groups into thread ids. Messages the server did
/// not place in any group fall back to reference grouping.
pub fn group_by_server(
    groups: &[ThreadGroup],
    messages: &[(u32, &ParsedHeaders)],
    known: &HashMap<String, String>,
) -> HashMap<u32, String> {
    let by_seq: HashMap<u32, &ParsedHeaders> = messages.iter().copied().collect();
    let mut assigned = HashMap::new();

    for group in groups {
        let members: Vec<&ParsedHeaders> = group
            .iter()
            .filter_map(|seq| by_seq.get(seq).copied())
            .collect();
        if members.is_empty() {
            continue;
        }
        let thread_id = thread_id_for(&members, known);
        for seq in group {
            if by_seq.contains_key(seq) {
                assigned.insert(*seq, thread_id.clone());
            }
        }
    }

    let leftovers: Vec<(u32, &ParsedHeaders)> = messages
        .iter()
        .copied()
        .filter(|(seq, _)| !assigned.contains_key(seq))
        .collect();
    if !leftovers.is_empty() {
        assigned.extend(group_by_references(&leftovers, known));
    }

    assigned
}

/// Pick the id for one conversation: a stored id if any member (or anything a
/// member references) already has one, otherwise the root of the earliest message.
fn thread_id_for(group: &[&ParsedHeaders], known: &HashMap<String, String>) -> String {
    let mut ordered: Vec<&ParsedHeaders> = group.to_vec();
    ordered.sort_by(|left, right| {
        left.sent_at
            .cmp(&right.sent_at)
            .then_with(|| left.message_id.cmp(&right.message_id))
    });

    for headers in &ordered {
        if let Some(thread_id) = known.get(&headers.message_id) {
            return thread_id.clone();
        }
    }

    let referenced: BTreeSet<&str> = ordered.iter().flat_map(|h| h.parent_ids()).collect();
    if let Some(thread_id) = referenced.iter().find_map(|id| known.get(*id)) {
        return thread_id.clone();
    }

    let Some(earliest) = ordered.first() else {
        return String::new();
    };
    earliest
        .references
        .first()
        .cloned()
        .or_else(|| earliest.in_reply_to.clone())
        .unwrap_or_else(|| earliest.message_id.clone())
}

/// Union-find over message identifiers.
#[derive(Default)]
struct IdSets {
    index: HashMap<String, usize>,
    parent: Vec<usize>,
}

impl IdSets {
    fn node(&mut self, id: &str) -> usize {
        if let Some(node) = self.index.get(id) {
            return *node;
        }
        let node = self.parent.len();
        self.parent.push(node);
        self.index.insert(id.to_string(), node);
        node
    }

    fn find(&mut self, mut node: usize) -> usize {
        while self.parent[node] != node {
            self.parent[node] = self.parent[self.parent[node]];
            node = self.parent[node];
        }
        node
    }

    fn union(&mut self, left: usize, right: usize) {
        let left = self.find(left);
        let right = self.find(right);
        if left != right {
            self.parent[right] = left;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{group_by_references, group_by_server};
    use crate::sync::parse::ParsedHeaders;

    use chrono::{DateTime, Duration, Utc};
    use std::collections::{HashMap, HashSet};

    fn headers(id: &str, refs: &[&str], in_reply_to: Option<&str>, minutes: i64) -> ParsedHeaders {
        ParsedHeaders {
            message_id: id.to_string(),
            in_reply_to: in_reply_to.map(str::to_string),
            references: refs.iter().map(|r| r.to_string()).collect(),
            from: "a@example.com".into(),
            to: "b@example.com".into(),
            cc: String::new(),
            subject: format!("subject {id}"),
            sent_at: DateTime::<Utc>::UNIX_EPOCH + Duration::minutes(minutes),
        }
    }

    fn five_messages() -> Vec<ParsedHeaders> {
        vec![
            headers("a", &[], None, 0),
            headers("b", &["a"], Some("a"), 1),
            headers("c", &["a", "b"], Some("b"), 2),
            headers("d", &[], None, 3),
            headers("e", &[], Some("d"), 4),
        ]
    }

    #[test]
    fn reference_grouping_links_replies() {
        let messages = five_messages();
        let input: Vec<(u32, &ParsedHeaders)> =
            messages.iter().enumerate().map(|(i, h)| (i as u32 + 1, h)).collect();

        let threads = group_by_references(&input, &HashMap::new());
        assert_eq!(threads[&1], "a");
        assert_eq!(threads[&2], "a");
        assert_eq!(threads[&3], "a");
        assert_eq!(threads[&4], "d");
        assert_eq!(threads[&5], "d");
    }

    #[test]
    fn reference_and_server_grouping_agree() {
        let messages = five_messages();
        let input: Vec<(u32, &ParsedHeaders)> =
            messages.iter().enumerate().map(|(i, h)| (i as u32 + 1, h)).collect();

        let by_refs = group_by_references(&input, &HashMap::new());
        let by_server = group_by_server(&[vec![1, 2, 3], vec![4, 5]], &input, &HashMap::new());

        let count = |threads: &HashMap<u32, String>| threads.values().collect::<HashSet<_>>().len();
        assert_eq!(count(&by_refs), 2);
        assert_eq!(count(&by_server), 2);
        assert_eq!(by_refs, by_server);
    }

    #[test]
    fn missing_root_uses_first_reference() {
        let messages = [headers("b", &["a"], Some("a"), 1), headers("c", &["a", "b"], Some("b"), 2)];
        let input: Vec<(u32, &ParsedHeaders)> = vec![(7, &messages[0]), (8, &messages[1])];

        let threads = group_by_references(&input, &HashMap::new());
        assert_eq!(threads[&7], "a");
        assert_eq!(threads[&8], "a");
    }

    #[test]
    fn stored_thread_ids_are_kept() {
        let messages = [headers("x", &["old-root"], Some("old-root"), 5)];
        let input: Vec<(u32, &ParsedHeaders)> = vec![(11, &messages[0])];
        let known = HashMap::from([("old-root".to_string(), "thread-42".to_string())]);

        let threads = group_by_references(&input, &known);
        assert_eq!(threads[&11], "thread-42");
    }

    #[test]
    fn server_leftovers_fall_back_to_references() {
        let messages = five_messages();
        let input: Vec<(u32, &ParsedHeaders)> =
            messages.iter().enumerate().map(|(i, h)| (i as u32 + 1, h)).collect();

        let threads = group_by_server(&[vec![1, 2, 3]], &input, &HashMap::new());
        assert_eq!(threads.len(), 5);
        assert_eq!(threads[&5], "d");
    }
}
