//! Evaluator closures.

use {
    crate::{context::Context, value::Value},
    std::rc::Rc,
};

/// Handle to a per-datatype evaluator.
///
/// The compiler generates one evaluator for every datatype that can
/// be lazy. Its contract with the forcer:
///
///  - The input is an owned handle to a *uniquely referenced* block
///    whose tag is one of the datatype's lazy constructors (on the
///    thread-local path the forcer hands it a private copy of the
///    thunk, never the black-holed original).
///  - The evaluator consumes that cell: it unpacks the fields and
///    either reuses the storage for its result or disposes of it,
///    typically through [`make_indirect`][`crate::lazy::make_indirect`].
///  - It returns an owned handle to the head-normal form. It may
///    allocate and may itself trigger further forcing, but it must
///    not retain the input handle.
///
/// Generated evaluators are statically allocated function pointers,
/// for which cloning and dropping the handle are free; dynamically
/// constructed evaluators live behind an [`Rc`].
#[derive(Clone)]
pub struct Evaluator
{
    repr: Repr,
}

#[derive(Clone)]
enum Repr
{
    Static(fn(Value, &mut Context) -> Value),
    Dynamic(Rc<dyn Fn(Value, &mut Context) -> Value>),
}

impl Evaluator
{
    /// Wrap a statically-allocated evaluator function.
    pub fn from_fn(eval: fn(Value, &mut Context) -> Value) -> Self
    {
        Self{repr: Repr::Static(eval)}
    }

    /// Wrap a dynamically-constructed evaluator closure.
    pub fn new(eval: impl Fn(Value, &mut Context) -> Value + 'static) -> Self
    {
        Self{repr: Repr::Dynamic(Rc::new(eval))}
    }

    /// Apply the evaluator to a thunk.
    pub fn call(&self, thunk: Value, context: &mut Context) -> Value
    {
        match &self.repr {
            Repr::Static(eval)  => eval(thunk, context),
            Repr::Dynamic(eval) => eval(thunk, context),
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn double(value: Value, _context: &mut Context) -> Value
    {
        Value::unboxed(value.as_unboxed().unwrap() * 2)
    }

    #[test]
    fn static_evaluators_apply()
    {
        let mut context = Context::new();
        let eval = Evaluator::from_fn(double);
        let result = eval.call(Value::unboxed(21), &mut context);
        assert_eq!(result.as_unboxed(), Some(42));
    }

    #[test]
    fn dynamic_evaluators_capture_and_survive_cloning()
    {
        let mut context = Context::new();
        let offset = 5;
        let eval = Evaluator::new(move |value, _context| {
            Value::unboxed(value.as_unboxed().unwrap() + offset)
        });
        let copy = eval.clone();
        assert_eq!(copy.call(Value::unboxed(2), &mut context).as_unboxed(), Some(7));
    }
}
