use crate::core::device::DeviceId;
use crate::error::{Error, Result};
use crate::runtime::manager::Event;

/// Dependency lists of a running program. Each entry remembers the device
/// that produced the event.
#[derive(Debug, Clone)]
pub struct EventLists {
    lists: Vec<Vec<(DeviceId, Event)>>,
    capacity: usize,
}

impl EventLists {
    pub fn new(count: usize, capacity: usize) -> Self {
        Self {
            lists: (0..count).map(|_| Vec::with_capacity(capacity)).collect(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    pub fn push(&mut self, list: usize, device: DeviceId, event: Event) -> Result<()> {
        let capacity = self.capacity;
        let entries = self
            .lists
            .get_mut(list)
            .ok_or_else(|| Error::execution(format!("dependency list {list} out of range")))?;
        if entries.len() >= capacity {
            return Err(Error::execution(format!(
                "dependency list {list} is full ({capacity} events)"
            )));
        }
        entries.push((device, event));
        Ok(())
    }

    pub fn get(&self, list: usize) -> &[(DeviceId, Event)] {
        self.lists.get(list).map_or(&[][..], Vec::as_slice)
    }

    /// Removes and returns the contents of a list, leaving it empty.
    pub fn take(&mut self, list: usize) -> Vec<(DeviceId, Event)> {
        match self.lists.get_mut(list) {
            Some(entries) => std::mem::take(entries),
            None => Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        for entries in &mut self.lists {
            entries.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_is_an_error() {
        let d = DeviceId::new(0, 0);
        let mut lists = EventLists::new(2, 2);
        lists.push(1, d, Event(0)).unwrap();
        lists.push(1, d, Event(1)).unwrap();
        assert!(matches!(lists.push(1, d, Event(2)), Err(Error::Execution(_))));
        assert!(lists.push(2, d, Event(0)).is_err());

        assert_eq!(lists.take(1).len(), 2);
        assert!(lists.get(1).is_empty());
        lists.push(1, d, Event(3)).unwrap();
        assert_eq!(lists.get(1), &[(d, Event(3))]);
    }
}
