//! Descriptions of the location of a Tor relay, and of ways to connect to it.
//!
//! This crate provides the common types and traits used to describe relay
//! identities (RSA and Ed25519), relay addresses, and pluggable-transport
//! targets, along with code to encode and decode the link specifiers that
//! appear in `EXTEND`/`EXTEND2` cells and in onion-service descriptors.
// @@ begin lint list maintained by maint/add_warning @@
#![allow(renamed_and_removed_lints)] // @@REMOVE_WHEN(ci_arti_stable)
#![allow(unknown_lints)] // @@REMOVE_WHEN(ci_arti_nightly)
#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cargo_common_metadata)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::expl_impl_clone_on_copy)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::implicit_clone)]
#![deny(clippy::large_stack_arrays)]
#![warn(clippy::manual_ok_or)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::option_option)]
#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]
#![warn(clippy::rc_buffer)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![warn(clippy::trait_duplication_in_bounds)]
#![deny(clippy::unchecked_duration_subtraction)]
#![deny(clippy::unnecessary_wraps)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]
#![allow(clippy::let_unit_value)] // This can reasonably be done for explicitness
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::significant_drop_in_scrutinee)] // arti/-/merge_requests/588/#note_2812945
#![allow(clippy::result_large_err)] // temporary workaround for arti#587
#![allow(clippy::needless_raw_string_hashes)] // complained-about code is fine, often best
//! <!-- @@ end lint list maintained by maint/add_warning @@ -->

mod decode;
mod ids;
mod ls;
mod owned;
mod traits;
mod transport;
mod verbatim;

pub use decode::{ChanTargetDecodeError, Strictness};
pub use ids::{RelayId, RelayIdError, RelayIdRef, RelayIdType, RelayIdTypeIter};
pub use ids::by_id::{ByRelayIds, ByRelayIdsError, ListByRelayIdsError};
pub use ids::set::RelayIdSet;
pub use ls::{EncodedLinkSpec, LinkSpec};
pub use owned::{
    IntoOwnedChanTarget, LoggedChanTarget, OwnedChanTarget, OwnedChanTargetBuilder,
    OwnedCircTarget, OwnedCircTargetBuilder, RelayIds, RelayIdsBuilder,
};
pub use traits::{
    ChanTarget, CircTarget, DirectChanMethodsHelper, DisplayChanTarget, DisplayRelayIds,
    HasAddrs, HasChanMethod, HasRelayIds, HasRelayIdsLegacy, RelayIdIter,
};
pub use transport::{
    BridgeAddr, BridgeAddrError, ChannelMethod, PtTarget, PtTargetAddr, PtTargetInvalidSetting,
    PtTargetSettings, PtTransportName, RetainAddrsError, TransportId, TransportIdError,
};
pub use verbatim::VerbatimLinkSpecCircTarget;
