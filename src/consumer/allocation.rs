/* Licensed to the Apache Software Foundation (ASF) under one
 * or more contributor license agreements.  See the NOTICE file
 * distributed with this work for additional information
 * regarding copyright ownership.  The ASF licenses this file
 * to you under the Apache License, Version 2.0 (the
 * "License"); you may not use this file except in compliance
 * with the License.  You may obtain a copy of the License at
 *
 *   http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing,
 * software distributed under the License is distributed on an
 * "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
 * KIND, either express or implied.  See the License for the
 * specific language governing permissions and limitations
 * under the License.
 */

use crate::queue::QueueId;
use tracing::warn;

/// A strategy splitting a topic's queues among the live members of a group.
///
/// Implementations must be deterministic: given the same sorted member list
/// and sorted queue list, the assignments computed by all members are pairwise
/// disjoint and cover every queue, and no member is starved while members do
/// not outnumber queues.
pub trait AllocationStrategy: Send + Sync + std::fmt::Debug + 'static {
    fn name(&self) -> &'static str;

    /// Computes the target queue set for `member_id`. `members` and `queues`
    /// are sorted by the caller.
    fn allocate(&self, member_id: &str, members: &[String], queues: &[QueueId]) -> Vec<QueueId>;
}

/// Contiguous average split: each member takes one run of adjacent queues,
/// with the first `queues % members` members taking one extra.
#[derive(Debug, Default)]
pub struct AverageAllocation;

impl AllocationStrategy for AverageAllocation {
    fn name(&self) -> &'static str {
        "average"
    }

    fn allocate(&self, member_id: &str, members: &[String], queues: &[QueueId]) -> Vec<QueueId> {
        let Some(index) = members.iter().position(|m| m == member_id) else {
            warn!(member_id, "member not in group member list, allocating nothing");
            return Vec::new();
        };
        if queues.is_empty() {
            return Vec::new();
        }
        let remainder = queues.len() % members.len();
        let share = if queues.len() <= members.len() {
            1
        } else if remainder > 0 && index < remainder {
            queues.len() / members.len() + 1
        } else {
            queues.len() / members.len()
        };
        let start = if remainder > 0 && index < remainder {
            index * share
        } else {
            index * share + remainder
        };
        if start >= queues.len() {
            return Vec::new();
        }
        let count = share.min(queues.len() - start);
        queues[start..start + count].to_vec()
    }
}

/// Round-robin split: queue `i` goes to member `i % members`.
#[derive(Debug, Default)]
pub struct CircularAllocation;

impl AllocationStrategy for CircularAllocation {
    fn name(&self) -> &'static str {
        "circular"
    }

    fn allocate(&self, member_id: &str, members: &[String], queues: &[QueueId]) -> Vec<QueueId> {
        let Some(index) = members.iter().position(|m| m == member_id) else {
            warn!(member_id, "member not in group member list, allocating nothing");
            return Vec::new();
        };
        queues
            .iter()
            .enumerate()
            .filter(|(i, _)| i % members.len() == index)
            .map(|(_, queue)| queue.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn queues(n: u32) -> Vec<QueueId> {
        (0..n).map(|i| QueueId::new("orders", "broker-a", i)).collect()
    }

    fn members(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("member-{i}")).collect()
    }

    fn assert_complete_and_disjoint(strategy: &dyn AllocationStrategy, members: &[String], queues: &[QueueId]) {
        let mut seen = HashSet::new();
        let mut total = 0;
        for member in members {
            let assigned = strategy.allocate(member, members, queues);
            total += assigned.len();
            for queue in assigned {
                assert!(seen.insert(queue), "queue assigned twice");
            }
        }
        assert_eq!(total, queues.len(), "union must cover every queue");
    }

    #[test]
    fn average_split_of_four_queues_over_three_members() {
        let members = members(3);
        let queues = queues(4);
        let sizes: Vec<usize> = members
            .iter()
            .map(|m| AverageAllocation.allocate(m, &members, &queues).len())
            .collect();
        assert_eq!(sizes, vec![2, 1, 1]);
        // First member takes the first contiguous run.
        let first = AverageAllocation.allocate(&members[0], &members, &queues);
        assert_eq!(first, vec![queues[0].clone(), queues[1].clone()]);
        assert_complete_and_disjoint(&AverageAllocation, &members, &queues);
    }

    #[test]
    fn average_covers_all_shapes() {
        for member_count in 1..=8 {
            for queue_count in 0..=16 {
                let members = members(member_count);
                let queues = queues(queue_count);
                assert_complete_and_disjoint(&AverageAllocation, &members, &queues);
            }
        }
    }

    #[test]
    fn average_with_more_members_than_queues_starves_the_tail() {
        let members = members(5);
        let queues = queues(3);
        assert_eq!(AverageAllocation.allocate(&members[0], &members, &queues).len(), 1);
        assert_eq!(AverageAllocation.allocate(&members[3], &members, &queues).len(), 0);
        assert_complete_and_disjoint(&AverageAllocation, &members, &queues);
    }

    #[test]
    fn circular_covers_all_shapes() {
        for member_count in 1..=8 {
            for queue_count in 0..=16 {
                let members = members(member_count);
                let queues = queues(queue_count);
                assert_complete_and_disjoint(&CircularAllocation, &members, &queues);
            }
        }
    }

    #[test]
    fn unknown_member_gets_nothing() {
        let members = members(3);
        let queues = queues(4);
        assert!(AverageAllocation.allocate("stranger", &members, &queues).is_empty());
    }
}
