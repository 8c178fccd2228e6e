/// Consumer callbacks invoked by the processor after each delta is applied.
///
/// Errors are logged and counted by the processor; they never stop it.
pub trait ResourceEventHandler<T>: Send + Sync {
    fn on_add(&self, _obj: &T) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_update(&self, _old: &T, _new: &T) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_delete(&self, _obj: &T) -> anyhow::Result<()> {
        Ok(())
    }
}

type AddFn<T> = Box<dyn Fn(&T) -> anyhow::Result<()> + Send + Sync>;
type UpdateFn<T> = Box<dyn Fn(&T, &T) -> anyhow::Result<()> + Send + Sync>;

/// Closure-backed handler; unset callbacks are no-ops.
pub struct HandlerFns<T> {
    add: Option<AddFn<T>>,
    update: Option<UpdateFn<T>>,
    delete: Option<AddFn<T>>,
}

impl<T> Default for HandlerFns<T> {
    fn default() -> Self {
        Self { add: None, update: None, delete: None }
    }
}

impl<T> HandlerFns<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_add(mut self, f: impl Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static) -> Self {
        self.add = Some(Box::new(f));
        self
    }

    pub fn with_update(mut self, f: impl Fn(&T, &T) -> anyhow::Result<()> + Send + Sync + 'static) -> Self {
        self.update = Some(Box::new(f));
        self
    }

    pub fn with_delete(mut self, f: impl Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static) -> Self {
        self.delete = Some(Box::new(f));
        self
    }
}

impl<T> ResourceEventHandler<T> for HandlerFns<T> {
    fn on_add(&self, obj: &T) -> anyhow::Result<()> {
        self.add.as_ref().map_or(Ok(()), |f| f(obj))
    }

    fn on_update(&self, old: &T, new: &T) -> anyhow::Result<()> {
        self.update.as_ref().map_or(Ok(()), |f| f(old, new))
    }

    fn on_delete(&self, obj: &T) -> anyhow::Result<()> {
        self.delete.as_ref().map_or(Ok(()), |f| f(obj))
    }
}
