use uuid::Uuid;

use crate::entities::RideRequest;

/// A driver session's view of requests still waiting for a driver, oldest first.
#[derive(Clone, Debug, Default)]
pub struct MatchingPool {
    requests: Vec<RideRequest>,
}

impl MatchingPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a searching request. Returns whether the pool changed.
    pub fn on_inserted(&mut self, request: &RideRequest) -> bool {
        if !request.is_searching() || self.contains(request.id) {
            return false;
        }

        let key = (request.created_at, request.id);
        let position = self
            .requests
            .partition_point(|member| (member.created_at, member.id) < key);

        self.requests.insert(position, request.clone());
        true
    }

    /// Drops a request that left the searching state. A searching snapshot of a
    /// member replaces the stored one. Returns whether the request was removed.
    pub fn on_updated(&mut self, request: &RideRequest) -> bool {
        if request.is_searching() {
            if let Some(member) = self.requests.iter_mut().find(|m| m.id == request.id) {
                *member = request.clone();
            }
            return false;
        }

        self.remove(request.id)
    }

    pub fn remove(&mut self, id: Uuid) -> bool {
        let before = self.requests.len();
        self.requests.retain(|member| member.id != id);
        self.requests.len() != before
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.requests.iter().any(|member| member.id == id)
    }

    pub fn get(&self, id: Uuid) -> Option<&RideRequest> {
        self.requests.iter().find(|member| member.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RideRequest> {
        self.requests.iter()
    }

    pub fn clear(&mut self) {
        self.requests.clear();
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn snapshot(&self) -> Vec<RideRequest> {
        self.requests.clone()
    }
}
