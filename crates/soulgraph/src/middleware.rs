use crate::events::ListenerId;
use parking_lot::RwLock;
use std::sync::Arc;

/// One stage of a transform pipeline. Returning `None` vetoes the value.
pub trait Middleware<T, C: ?Sized>: Send + Sync {
    fn process(&self, value: T, ctx: &C) -> Option<T>;
}

impl<T, C: ?Sized, F> Middleware<T, C> for F
where
    F: Fn(T, &C) -> Option<T> + Send + Sync,
{
    fn process(&self, value: T, ctx: &C) -> Option<T> {
        self(value, ctx)
    }
}

/// Ordered pipeline of [`Middleware`] stages.
pub struct MiddlewareSystem<T, C: ?Sized = ()> {
    name: String,
    stages: RwLock<Vec<(ListenerId, Arc<dyn Middleware<T, C>>)>>,
}

impl<T, C: ?Sized> MiddlewareSystem<T, C> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a stage; it runs after every stage registered before it.
    pub fn use_middleware(&self, stage: Arc<dyn Middleware<T, C>>) -> ListenerId {
        let id = ListenerId::next();
        self.stages.write().push((id, stage));
        id
    }

    pub fn unuse(&self, id: ListenerId) -> bool {
        let mut stages = self.stages.write();
        let before = stages.len();
        stages.retain(|(sid, _)| *sid != id);
        stages.len() != before
    }

    pub fn len(&self) -> usize {
        self.stages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.read().is_empty()
    }

    pub fn process(&self, value: T, ctx: &C) -> Option<T> {
        let stages: Vec<_> = self.stages.read().iter().map(|(_, s)| Arc::clone(s)).collect();
        stages
            .iter()
            .try_fold(value, |value, stage| stage.process(value, ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stages_run_in_order() {
        let system: MiddlewareSystem<String> = MiddlewareSystem::new("text");
        system.use_middleware(Arc::new(|s: String, _: &()| Some(s + "a")));
        system.use_middleware(Arc::new(|s: String, _: &()| Some(s + "b")));
        assert_eq!(system.process(String::new(), &()), Some("ab".to_string()));
    }

    #[test]
    fn test_veto_stops_pipeline() {
        let system: MiddlewareSystem<u32, u32> = MiddlewareSystem::new("limit");
        system.use_middleware(Arc::new(|n: u32, max: &u32| (n <= *max).then_some(n)));
        system.use_middleware(Arc::new(|n: u32, _: &u32| Some(n * 10)));
        assert_eq!(system.process(3, &5), Some(30));
        assert_eq!(system.process(6, &5), None);
    }

    #[test]
    fn test_unuse() {
        let system: MiddlewareSystem<u32> = MiddlewareSystem::new("n");
        let id = system.use_middleware(Arc::new(|_: u32, _: &()| None));
        assert_eq!(system.process(1, &()), None);
        assert!(system.unuse(id));
        assert!(system.is_empty());
        assert_eq!(system.process(1, &()), Some(1));
    }
}
