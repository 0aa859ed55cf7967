//! Process-wide flags are shared by every test in a binary, so they're all exercised in one test.

use sd_async_context::{
	apply_env_overrides, disable, enable, is_disabled, native_hooks_active, probe_native_support,
	Error, Flags, NativeBridge, Patch,
};

use std::env;

use tracing_test::traced_test;

mod common;

use common::FakeHost;

#[test]
#[traced_test]
fn flags_env_overrides_and_capability_probe() {
	// Environment overrides
	env::set_var(Patch::Fs.env_var(), "1");
	env::set_var(Patch::Crypto.env_var(), "off");
	apply_env_overrides().unwrap();

	assert!(is_disabled(Patch::Fs));
	assert!(!is_disabled(Patch::Crypto));
	assert!(Flags::load().is_disabled(Patch::Fs));

	env::set_var(Patch::Promise.env_var(), "sometimes");
	assert!(matches!(
		apply_env_overrides(),
		Err(Error::InvalidConfig { var, .. }) if var == Patch::Promise.env_var()
	));
	assert!(!is_disabled(Patch::Promise));

	for patch in Patch::ALL {
		env::remove_var(patch.env_var());
	}
	enable(Patch::Fs);
	assert_eq!(Flags::load(), Flags::default());

	// A host without native async hooks
	let host = FakeHost::unavailable();
	assert!(!probe_native_support(&host));
	assert!(is_disabled(Patch::NativeAsyncHooks));
	assert!(logs_contain("Native async hooks unavailable"));

	enable(Patch::NativeAsyncHooks);
	let bridge = NativeBridge::activate(&host);
	assert!(!bridge.is_active());
	assert!(!host.is_registered());
	assert!(!native_hooks_active());
	assert!(is_disabled(Patch::NativeAsyncHooks));
	drop(bridge);

	// Disabled up front, the host is never even probed
	let host = FakeHost::new();
	let bridge = NativeBridge::activate(&host);
	assert!(!bridge.is_active());
	assert!(!host.is_registered());
	drop(bridge);

	// Working host
	enable(Patch::NativeAsyncHooks);
	disable(Patch::UnhandledError);

	let bridge = NativeBridge::activate(&host);
	assert!(bridge.is_active());
	assert!(host.is_registered());
	assert!(native_hooks_active());
	assert_eq!(
		bridge.flags(),
		Some(Flags::default().with_disabled(Patch::UnhandledError))
	);

	// Flags are read once, at activation
	disable(Patch::Timers);
	host.init(1, "Timeout");
	assert!(bridge.task(1).is_some());
	host.destroy(1);

	drop(bridge);
	assert!(!native_hooks_active());

	enable(Patch::Timers);
	enable(Patch::UnhandledError);
}
