//! ristretto is a minimal interpreter for a subset of the JVM class
//! file format and bytecode: integer arithmetic, branching, static
//! calls, int arrays, and printing through the println intrinsic.
pub mod bytecode;
pub mod heap;
pub mod jvm;
pub mod program;
pub mod runtime;
