#[cfg(test)]
mod cf_test;
#[cfg(test)]
mod streaming_test;
