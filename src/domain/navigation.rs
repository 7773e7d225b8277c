//! Page topology of the device
//!
//! ```text
//!   simplePenetration <──> menu <──> strokeEngine
//! ```

use crate::domain::models::Page;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;

/// Adjacency list: each page with the pages reachable by one `go:` command
pub type NavigationGraph<N> = [(N, &'static [N])];

pub static NAVIGATION_GRAPH: &NavigationGraph<Page> = &[
    (Page::Menu, &[Page::SimplePenetration, Page::StrokeEngine]),
    (Page::SimplePenetration, &[Page::Menu]),
    (Page::StrokeEngine, &[Page::Menu]),
];

fn neighbours<N: Copy + Eq>(graph: &NavigationGraph<N>, node: N) -> &'static [N] {
    graph
        .iter()
        .find(|(n, _)| *n == node)
        .map(|(_, edges)| *edges)
        .unwrap_or(&[])
}

/// Hops to take from `from` to reach `to`, excluding `from` itself.
///
/// Breadth-first, so the path is one of the shortest; ties go to the edge
/// listed first. Returns `None` when `to` cannot be reached.
pub fn shortest_path<N>(graph: &NavigationGraph<N>, from: N, to: N) -> Option<Vec<N>>
where
    N: Copy + Eq + Hash,
{
    if from == to {
        return Some(Vec::new());
    }
    if neighbours(graph, from).contains(&to) {
        return Some(vec![to]);
    }

    let mut parent: HashMap<N, N> = HashMap::new();
    let mut visited: HashSet<N> = HashSet::from([from]);
    let mut queue = VecDeque::from([from]);

    while let Some(node) = queue.pop_front() {
        for &next in neighbours(graph, node) {
            if !visited.insert(next) {
                continue;
            }
            parent.insert(next, node);
            if next == to {
                let mut path = vec![to];
                let mut cursor = to;
                while let Some(&prev) = parent.get(&cursor) {
                    if prev == from {
                        break;
                    }
                    path.push(prev);
                    cursor = prev;
                }
                path.reverse();
                return Some(path);
            }
            queue.push_back(next);
        }
    }

    None
}
