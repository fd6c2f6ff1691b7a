//! Governed Reactions
//!
//! [`react`] wraps a callback in a small tree of reactions so that its
//! lifetime can be driven by other values:
//!
//! - `from`: the callback starts the first time this becomes true
//! - `when`: while started, the callback only runs while this is true
//! - `until`: once this becomes true, everything stops for good
//!
//! # Layout
//!
//! ```text
//! starter    watches `from`, starts the controller, then stops itself
//!   └── controller   watches `(until, when)`, starts and stops the leaf
//!         └── leaf   watches the source, runs the callback
//! ```
//!
//! Each reaction governs the one below it, so the controller always sees a
//! write before the leaf does. A single write that both changes the source
//! and flips `until` stops the leaf before it can fire.

use std::fmt;

use super::atom::Atom;
use super::derivable::Derivable;
use super::derivation::{derive, try_derive, Derivation};
use super::reaction::Reaction;
use crate::error::Result;

/// A boolean input to [`ReactOptions`].
#[derive(Clone)]
pub enum Condition {
    Const(bool),
    Derived(Derivable<bool>),
}

impl Condition {
    /// A condition computed by `f`, re-evaluated when what it reads changes.
    pub fn func(f: impl Fn() -> bool + 'static) -> Self {
        Condition::Derived(derive(f).derivable())
    }

    pub fn try_func(f: impl Fn() -> Result<bool> + 'static) -> Self {
        Condition::Derived(try_derive(f).derivable())
    }

    fn into_derivable(self) -> Derivable<bool> {
        match self {
            Condition::Const(value) => derive(move || value).derivable(),
            Condition::Derived(derivable) => derivable,
        }
    }
}

impl From<bool> for Condition {
    fn from(value: bool) -> Self {
        Condition::Const(value)
    }
}

impl From<Derivable<bool>> for Condition {
    fn from(derivable: Derivable<bool>) -> Self {
        Condition::Derived(derivable)
    }
}

impl From<&Atom<bool>> for Condition {
    fn from(atom: &Atom<bool>) -> Self {
        Condition::Derived(atom.derivable())
    }
}

impl From<Atom<bool>> for Condition {
    fn from(atom: Atom<bool>) -> Self {
        Condition::Derived(atom.derivable())
    }
}

impl From<&Derivation<bool>> for Condition {
    fn from(derivation: &Derivation<bool>) -> Self {
        Condition::Derived(derivation.derivable())
    }
}

impl From<Derivation<bool>> for Condition {
    fn from(derivation: Derivation<bool>) -> Self {
        Condition::Derived(derivation.derivable())
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Const(value) => f.debug_tuple("Const").field(value).finish(),
            Condition::Derived(derivable) => f.debug_tuple("Derived").field(derivable).finish(),
        }
    }
}

/// Options for [`react`].
///
/// # Example
///
/// ```rust
/// use derivable_core::reactive::{atom, ReactOptions};
///
/// let ready = atom(false);
/// let options = ReactOptions::new().from(&ready).skip_first(true);
/// ```
pub struct ReactOptions {
    from: Condition,
    when: Condition,
    until: Condition,
    skip_first: bool,
    once: bool,
    on_start: Option<Box<dyn FnMut()>>,
    on_stop: Option<Box<dyn FnMut()>>,
}

impl Default for ReactOptions {
    fn default() -> Self {
        Self {
            from: Condition::Const(true),
            when: Condition::Const(true),
            until: Condition::Const(false),
            skip_first: false,
            once: false,
            on_start: None,
            on_stop: None,
        }
    }
}

impl ReactOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from(mut self, condition: impl Into<Condition>) -> Self {
        self.from = condition.into();
        self
    }

    pub fn when(mut self, condition: impl Into<Condition>) -> Self {
        self.when = condition.into();
        self
    }

    pub fn until(mut self, condition: impl Into<Condition>) -> Self {
        self.until = condition.into();
        self
    }

    /// Swallow the first callback invocation.
    pub fn skip_first(mut self, skip: bool) -> Self {
        self.skip_first = skip;
        self
    }

    /// Stop everything after the callback has run once.
    pub fn once(mut self, once: bool) -> Self {
        self.once = once;
        self
    }

    /// Run `hook` whenever the callback reaction starts.
    pub fn on_start(mut self, hook: impl FnMut() + 'static) -> Self {
        self.on_start = Some(Box::new(hook));
        self
    }

    /// Run `hook` whenever the callback reaction stops.
    pub fn on_stop(mut self, hook: impl FnMut() + 'static) -> Self {
        self.on_stop = Some(Box::new(hook));
        self
    }
}

impl fmt::Debug for ReactOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactOptions")
            .field("from", &self.from)
            .field("when", &self.when)
            .field("until", &self.until)
            .field("skip_first", &self.skip_first)
            .field("once", &self.once)
            .finish_non_exhaustive()
    }
}

/// The reactions created by [`react`].
#[derive(Debug, Clone)]
pub struct ReactHandle {
    starter: Reaction,
    controller: Reaction,
    reaction: Reaction,
}

impl ReactHandle {
    /// Stop the callback and everything governing it.
    pub fn stop(&self) {
        self.reaction.stop();
        self.controller.stop();
        self.starter.stop();
    }

    /// Whether the callback is currently attached to its source.
    pub fn is_active(&self) -> bool {
        self.reaction.is_active()
    }

    /// Whether any part of the tree can still start the callback.
    pub fn is_alive(&self) -> bool {
        self.starter.is_active() || self.controller.is_active() || self.reaction.is_active()
    }

    /// The reaction that runs the callback.
    pub fn reaction(&self) -> &Reaction {
        &self.reaction
    }
}

/// Stop `reaction` and every reaction above it.
fn stop_with_governors(reaction: &Reaction) {
    let mut cursor = Some(reaction.clone());
    while let Some(current) = cursor {
        current.stop();
        cursor = current.governor();
    }
}

/// Run `callback` with the value of `source` whenever it changes, subject
/// to `options`.
pub fn react<T, S>(
    source: S,
    mut callback: impl FnMut(&T) -> Result<()> + 'static,
    options: ReactOptions,
) -> Result<ReactHandle>
where
    T: Clone + 'static,
    S: Into<Derivable<T>>,
{
    let ReactOptions {
        from,
        when,
        until,
        skip_first,
        once,
        on_start,
        on_stop,
    } = options;

    let mut skip = skip_first;
    let reaction = Reaction::with_handle(source, move |value: &T, this| {
        if skip {
            skip = false;
            return Ok(());
        }
        callback(value)?;
        if once {
            stop_with_governors(this);
        }
        Ok(())
    });
    reaction.set_hooks(on_start, on_stop);

    let until = until.into_derivable();
    let when = when.into_derivable();
    let gate = try_derive(move || Ok((until.get()?, when.get()?)));

    let leaf = reaction.clone();
    let controller = Reaction::with_handle(&gate, move |&(until, when): &(bool, bool), this| {
        if until {
            leaf.stop();
            stop_with_governors(this);
        } else if when {
            if !leaf.is_active() {
                leaf.start()?;
            }
        } else {
            leaf.stop();
        }
        Ok(())
    });
    controller.adopt(&reaction)?;

    let child = controller.clone();
    let starter = Reaction::with_handle(from.into_derivable(), move |&from: &bool, this| {
        if from {
            if !child.is_active() {
                child.start()?;
            }
            this.stop();
        }
        Ok(())
    });
    starter.adopt(&controller)?;

    let handle = ReactHandle {
        starter,
        controller,
        reaction,
    };
    // Nobody else can reach the tree if starting it fails.
    if let Err(err) = handle.starter.start() {
        handle.stop();
        return Err(err);
    }

    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::atom;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn log<T: Clone + 'static>() -> (Rc<RefCell<Vec<T>>>, impl FnMut(&T) -> Result<()>) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        (seen, move |v: &T| {
            sink.borrow_mut().push(v.clone());
            Ok(())
        })
    }

    #[test]
    fn default_options_behave_like_a_plain_reaction() {
        let a = atom(1);
        let (seen, cb) = log::<i32>();
        let handle = a.react(cb).unwrap();

        a.set(2).unwrap();
        assert!(handle.is_active());
        assert_eq!(*seen.borrow(), vec![1, 2]);

        handle.stop();
        a.set(3).unwrap();
        assert!(!handle.is_alive());
        assert_eq!(*seen.borrow(), vec![1, 2]);
    }

    #[test]
    fn from_delays_start() {
        let a = atom(0);
        let ready = atom(false);
        let (seen, cb) = log::<i32>();
        let handle = a.react_with(cb, ReactOptions::new().from(&ready)).unwrap();

        a.set(1).unwrap();
        assert!(seen.borrow().is_empty());
        assert!(!handle.is_active());

        ready.set(true).unwrap();
        assert_eq!(*seen.borrow(), vec![1]);

        ready.set(false).unwrap();
        a.set(2).unwrap();
        assert_eq!(*seen.borrow(), vec![1, 2]);
    }

    #[test]
    fn when_toggles_the_callback() {
        let a = atom(0);
        let on = atom(true);
        let (seen, cb) = log::<i32>();
        a.react_with(cb, ReactOptions::new().when(&on)).unwrap();

        on.set(false).unwrap();
        a.set(1).unwrap();
        assert_eq!(*seen.borrow(), vec![0]);

        on.set(true).unwrap();
        assert_eq!(*seen.borrow(), vec![0, 1]);
    }

    #[test]
    fn until_stops_for_good() {
        let a = atom(0);
        let done = atom(false);
        let (seen, cb) = log::<i32>();
        let handle = a.react_with(cb, ReactOptions::new().until(&done)).unwrap();

        done.set(true).unwrap();
        done.set(false).unwrap();
        a.set(1).unwrap();

        assert!(!handle.is_alive());
        assert_eq!(*seen.borrow(), vec![0]);
    }

    #[test]
    fn skip_first_and_once() {
        let a = atom(0);
        let (seen, cb) = log::<i32>();
        let handle = a
            .react_with(cb, ReactOptions::new().skip_first(true).once(true))
            .unwrap();

        assert!(seen.borrow().is_empty());
        a.set(1).unwrap();
        a.set(2).unwrap();

        assert_eq!(*seen.borrow(), vec![1]);
        assert!(!handle.is_alive());
    }

    #[test]
    fn hooks_follow_when() {
        let a = atom(0);
        let on = atom(true);
        let events = Rc::new(RefCell::new(Vec::new()));
        let (starts, stops) = (Rc::clone(&events), Rc::clone(&events));

        let options = ReactOptions::new()
            .when(&on)
            .on_start(move || starts.borrow_mut().push("start"))
            .on_stop(move || stops.borrow_mut().push("stop"));
        a.react_with(|_| Ok(()), options).unwrap();

        on.set(false).unwrap();
        on.set(true).unwrap();
        assert_eq!(*events.borrow(), vec!["start", "stop", "start"]);
    }

    #[test]
    fn functional_condition() {
        let a = atom(0);
        let limit = a.clone();
        let (seen, cb) = log::<i32>();
        a.react_with(cb, ReactOptions::new().until(Condition::func(move || limit.get() >= 2)))
            .unwrap();

        a.set(1).unwrap();
        a.set(2).unwrap();
        a.set(3).unwrap();
        assert_eq!(*seen.borrow(), vec![0, 1]);
    }
}
