//! Typed input slots and the tuple traits that tie an operator's terminal
//! types together.
//!
//! An operator's input list is a tuple of slot markers ([`Read`] for inputs
//! the body only observes, [`Write`] for inputs it mutates in place) and
//! its output list is a tuple of [`Out`] terminals. Rather than dispatching
//! per input through trait objects, the tuple impls are generated per arity,
//! so slot types, constness, and the message-unpack entry point for each
//! slot are all fixed at compile time.

use std::marker::PhantomData;
use std::sync::Arc;

use keyflow_data::{CopyHandle, Key, Value};
use keyflow_errors::KeyflowResult;

use crate::op::{deliver_msg, OpCore, SlotDecl};
use crate::terminal::{In, Out};

/// Marker for an input the body receives as `&V`. The data copy behind it
/// may be shared with other tasks.
pub struct Read<V: Value>(PhantomData<V>);

/// Marker for an input the body receives as `&mut V` and may mutate in
/// place. Binding registers for exclusive access, forking the value when
/// other readers already hold it.
pub struct Write<V: Value>(PhantomData<V>);

/// One element of an operator's input tuple.
pub trait InputSlot: Send + Sync + 'static {
    /// The value type carried on this slot.
    type Value: Value;
    /// Whether the body only reads this input.
    const IS_CONST: bool;
    /// The reference type handed to the body.
    type Ref<'a>;

    /// Build the body-visible reference from the bound copy.
    ///
    /// # Safety
    ///
    /// The caller must guarantee the protocol access this slot requires:
    /// a read registration for const slots, exclusive writer access for
    /// mutable ones, for the lifetime of the returned reference.
    unsafe fn make_ref(copy: &CopyHandle) -> Self::Ref<'_>;
}

impl<V: Value> InputSlot for Read<V> {
    type Value = V;
    const IS_CONST: bool = true;
    type Ref<'a> = &'a V;

    unsafe fn make_ref(copy: &CopyHandle) -> &V {
        copy.value::<V>()
    }
}

impl<V: Value> InputSlot for Write<V> {
    type Value = V;
    const IS_CONST: bool = false;
    type Ref<'a> = &'a mut V;

    unsafe fn make_ref(copy: &CopyHandle) -> &mut V {
        copy.value_mut::<V>()
    }
}

/// An operator's full input list: a tuple of [`InputSlot`]s.
pub trait InputSet<K: Key>: Send + Sync + 'static {
    /// Number of inputs.
    const ARITY: usize;
    /// The reference tuple handed to the body.
    type Refs<'a>;
    /// The matching tuple of input terminals.
    type Terminals: Clone + Send + Sync;
    /// The matching tuple of owned values, accepted by `invoke`.
    type Values: Send;

    /// Build the input terminal handles for `core`.
    fn terminals(core: &Arc<OpCore<K>>) -> Self::Terminals;

    /// Static per-slot facts the operator core needs at runtime.
    fn slot_decls() -> Vec<SlotDecl<K>>;

    /// Build the body's reference tuple from the ready task's bound copies.
    ///
    /// # Safety
    ///
    /// As for [`InputSlot::make_ref`], for every slot at once. The scheduler
    /// guarantees this between task release and input release.
    unsafe fn make_refs(copies: &[CopyHandle]) -> Self::Refs<'_>;

    /// Inject one task's worth of arguments (the `invoke` path).
    fn invoke(core: &Arc<OpCore<K>>, key: &K, values: Self::Values) -> KeyflowResult<()>;
}

impl<K: Key> InputSet<K> for () {
    const ARITY: usize = 0;
    type Refs<'a> = ();
    type Terminals = ();
    type Values = ();

    fn terminals(_core: &Arc<OpCore<K>>) -> Self::Terminals {}

    fn slot_decls() -> Vec<SlotDecl<K>> {
        Vec::new()
    }

    unsafe fn make_refs(_copies: &[CopyHandle]) -> Self::Refs<'_> {}

    fn invoke(core: &Arc<OpCore<K>>, key: &K, _values: Self::Values) -> KeyflowResult<()> {
        core.invoke_keyonly(key)
    }
}

macro_rules! impl_input_set {
    ($arity:expr; $(($idx:tt, $S:ident)),+) => {
        impl<K: Key, $($S: InputSlot),+> InputSet<K> for ($($S,)+) {
            const ARITY: usize = $arity;
            type Refs<'a> = ($(<$S as InputSlot>::Ref<'a>,)+);
            type Terminals = ($(In<K, <$S as InputSlot>::Value>,)+);
            type Values = ($(<$S as InputSlot>::Value,)+);

            fn terminals(core: &Arc<OpCore<K>>) -> Self::Terminals {
                ($(In::<K, <$S as InputSlot>::Value>::new(Arc::downgrade(core), $idx),)+)
            }

            fn slot_decls() -> Vec<SlotDecl<K>> {
                vec![$(SlotDecl {
                    is_const: <$S as InputSlot>::IS_CONST,
                    split_metadata: <<$S as InputSlot>::Value as Value>::SPLIT_METADATA,
                    deliver_msg: deliver_msg::<K, <$S as InputSlot>::Value>,
                }),+]
            }

            unsafe fn make_refs(copies: &[CopyHandle]) -> Self::Refs<'_> {
                ($(<$S as InputSlot>::make_ref(&copies[$idx]),)+)
            }

            fn invoke(core: &Arc<OpCore<K>>, key: &K, values: Self::Values) -> KeyflowResult<()> {
                $(core.set_arg::<<$S as InputSlot>::Value>(
                    $idx,
                    key,
                    crate::op::Carrier::Owned(values.$idx),
                )?;)+
                Ok(())
            }
        }
    };
}

impl_input_set!(1; (0, S0));
impl_input_set!(2; (0, S0), (1, S1));
impl_input_set!(3; (0, S0), (1, S1), (2, S2));
impl_input_set!(4; (0, S0), (1, S1), (2, S2), (3, S3));
impl_input_set!(5; (0, S0), (1, S1), (2, S2), (3, S3), (4, S4));
impl_input_set!(6; (0, S0), (1, S1), (2, S2), (3, S3), (4, S4), (5, S5));
impl_input_set!(7; (0, S0), (1, S1), (2, S2), (3, S3), (4, S4), (5, S5), (6, S6));
impl_input_set!(8; (0, S0), (1, S1), (2, S2), (3, S3), (4, S4), (5, S5), (6, S6), (7, S7));

/// An operator's full output list: a tuple of [`Out`] terminals.
pub trait OutputSet: Clone + Send + Sync + 'static {
    /// Number of outputs.
    const ARITY: usize;

    /// Build the terminals from the operator's output names.
    fn create(op: &str, names: &[String]) -> Self;

    /// Freeze the wiring; every terminal must have at least one successor.
    fn freeze(&self, op: &str) -> KeyflowResult<()>;
}

impl OutputSet for () {
    const ARITY: usize = 0;

    fn create(_op: &str, _names: &[String]) -> Self {}

    fn freeze(&self, _op: &str) -> KeyflowResult<()> {
        Ok(())
    }
}

macro_rules! impl_output_set {
    ($arity:expr; $(($idx:tt, $K:ident, $V:ident)),+) => {
        impl<$($K: Key, $V: Value),+> OutputSet for ($(Out<$K, $V>,)+) {
            const ARITY: usize = $arity;

            fn create(op: &str, names: &[String]) -> Self {
                ($(Out::<$K, $V>::new(op, &names[$idx]),)+)
            }

            fn freeze(&self, op: &str) -> KeyflowResult<()> {
                $(self.$idx.freeze(op)?;)+
                Ok(())
            }
        }
    };
}

impl_output_set!(1; (0, K0, V0));
impl_output_set!(2; (0, K0, V0), (1, K1, V1));
impl_output_set!(3; (0, K0, V0), (1, K1, V1), (2, K2, V2));
impl_output_set!(4; (0, K0, V0), (1, K1, V1), (2, K2, V2), (3, K3, V3));
impl_output_set!(5; (0, K0, V0), (1, K1, V1), (2, K2, V2), (3, K3, V3), (4, K4, V4));
impl_output_set!(6; (0, K0, V0), (1, K1, V1), (2, K2, V2), (3, K3, V3), (4, K4, V4), (5, K5, V5));
