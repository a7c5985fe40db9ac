use std::iter::Enumerate;

use crate::runner::{apply, Outcome};

type BoxedTask<I, O, E> = Box<dyn Fn(&I) -> Result<O, E> + Send + Sync>;

/// Applies the task lazily in the calling thread, one input per `next`.
pub(super) struct Sequential<I, O, E> {
    task: BoxedTask<I, O, E>,
    inputs: Enumerate<std::vec::IntoIter<I>>,
}

impl<I, O, E> Sequential<I, O, E> {
    pub fn new<F>(task: F, inputs: Vec<I>) -> Self
    where
        F: Fn(&I) -> Result<O, E> + Send + Sync + 'static,
    {
        Self {
            task: Box::new(task),
            inputs: inputs.into_iter().enumerate(),
        }
    }
}

impl<I, O, E> Iterator for Sequential<I, O, E> {
    type Item = Outcome<I, O, E>;

    fn next(&mut self) -> Option<Self::Item> {
        let (index, input) = self.inputs.next()?;
        Some(apply(&*self.task, index, input))
    }
}
