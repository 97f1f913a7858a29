use serde::{Deserialize, Serialize};

use crate::dispatch::{RpcService, ServiceBuilder};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TwoOperands {
    pub a: i64,
    pub b: i64,
}

impl TwoOperands {
    pub fn new(a: i64, b: i64) -> Self {
        Self { a, b }
    }
}

/// Integer arithmetic. Served as `ComputeS1.Add`, `ComputeS1.Sub`, `ComputeS1.Mul`, `ComputeS1.Div`.
#[derive(Debug, Default)]
pub struct ComputeS1;

impl ComputeS1 {
    pub fn add(&self, args: TwoOperands, out: &mut i64) -> Result<(), String> {
        *out = args
            .a
            .checked_add(args.b)
            .ok_or_else(|| format!("overflow: {} + {}", args.a, args.b))?;
        Ok(())
    }

    pub fn sub(&self, args: TwoOperands, out: &mut i64) -> Result<(), String> {
        *out = args
            .a
            .checked_sub(args.b)
            .ok_or_else(|| format!("overflow: {} - {}", args.a, args.b))?;
        Ok(())
    }

    pub fn mul(&self, args: TwoOperands, out: &mut i64) -> Result<(), String> {
        *out = args
            .a
            .checked_mul(args.b)
            .ok_or_else(|| format!("overflow: {} * {}", args.a, args.b))?;
        Ok(())
    }

    pub fn div(&self, args: TwoOperands, out: &mut i64) -> Result<(), String> {
        if args.b == 0 {
            return Err("division by zero".into());
        }
        *out = args
            .a
            .checked_div(args.b)
            .ok_or_else(|| format!("overflow: {} / {}", args.a, args.b))?;
        Ok(())
    }
}

impl RpcService for ComputeS1 {
    fn register_methods(methods: ServiceBuilder<Self>) -> ServiceBuilder<Self> {
        methods
            .method("Add", Self::add)
            .method("Sub", Self::sub)
            .method("Mul", Self::mul)
            .method("Div", Self::div)
    }
}
