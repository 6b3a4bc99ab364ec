// Identity integration tests

mod keypair_test;
mod signer_test;
