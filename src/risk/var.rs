use super::{ErrorPolicy, GateAction, GateResult, MarketData, Portfolio, RiskGate};
use crate::config::RiskConfig;
use crate::errors::GateError;
use statrs::distribution::{ContinuousCDF, Normal};

/// Fewer daily returns than this and we assume `FALLBACK_VOL`.
const MIN_OBSERVATIONS: usize = 5;

/// Conservative daily volatility used when history is too short.
const FALLBACK_VOL: f64 = 0.05;

/// Parametric value-at-risk.
///
/// VaR_i = Z(confidence) * stdev(daily returns_i) * market_value_i
/// VaR%  = sum_i VaR_i / total_value * 100
///
/// Breach (VaR% > max_var_pct) -> reduce. Advisory: fail-open.
pub struct ValueAtRiskGate {
    confidence: f64,
    max_var_pct: f64,
    lookback_days: usize,
    last_var_pct: Option<f64>,
    last_per_position: Vec<(String, f64)>,
}

impl ValueAtRiskGate {
    pub const NAME: &'static str = "value_at_risk";

    pub fn new(cfg: &RiskConfig) -> Self {
        Self {
            confidence: cfg.var_confidence,
            max_var_pct: cfg.var_max_pct,
            lookback_days: cfg.var_lookback_days,
            last_var_pct: None,
            last_per_position: Vec::new(),
        }
    }

    pub fn lookback_days(&self) -> usize {
        self.lookback_days
    }

    /// One-sided z-score for the configured confidence (0.95 -> ~1.645).
    pub fn z_score(&self) -> Result<f64, GateError> {
        let normal = Normal::new(0.0, 1.0).map_err(|e| GateError::Computation(format!("normal: {e}")))?;
        let z = normal.inverse_cdf(self.confidence);
        if !z.is_finite() || z <= 0.0 {
            return Err(GateError::Computation(format!("bad z for confidence {}", self.confidence)));
        }
        Ok(z)
    }

    /// Sample stdev of simple daily returns over the last `lookback_days`.
    pub fn daily_volatility(&self, closes: &[f64]) -> f64 {
        let start = closes.len().saturating_sub(self.lookback_days + 1);
        let returns: Vec<f64> = closes[start..]
            .windows(2)
            .filter(|w| w[0] > 0.0)
            .map(|w| w[1] / w[0] - 1.0)
            .filter(|r| r.is_finite())
            .collect();

        if returns.len() < MIN_OBSERVATIONS {
            return FALLBACK_VOL;
        }

        let n = returns.len() as f64;
        let mean = returns.iter().sum::<f64>() / n;
        let var = returns.iter().map(|r| (r - mean) * (r - mean)).sum::<f64>() / (n - 1.0);
        var.sqrt()
    }

    pub fn evaluate(&mut self, portfolio: &Portfolio, market_data: &MarketData) -> Result<GateResult, GateError> {
        if portfolio.total_value <= 0.0 {
            return Err(GateError::InvalidInput("total_value must be positive".into()));
        }
        let z = self.z_score()?;

        let mut per_position = Vec::with_capacity(portfolio.positions.len());
        let mut total_var = 0.0;
        for p in &portfolio.positions {
            let closes = market_data
                .price_history
                .get(&p.ticker)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            let vol = self.daily_volatility(closes);
            let var = z * vol * p.market_value.abs();
            if !var.is_finite() {
                return Err(GateError::Computation(format!("{}: non-finite VaR", p.ticker)));
            }
            per_position.push((p.ticker.clone(), var));
            total_var += var;
        }

        let var_pct = total_var / portfolio.total_value * 100.0;
        self.last_var_pct = Some(var_pct);
        self.last_per_position = per_position;

        let result = if var_pct > self.max_var_pct {
            tracing::warn!(var_pct = var_pct, max = self.max_var_pct, "VaR limit breached");
            GateResult::new(
                Self::NAME,
                true,
                GateAction::Reduce,
                format!("VaR {var_pct:.2}% > max {:.2}%", self.max_var_pct),
            )
        } else {
            GateResult::allow(Self::NAME, format!("VaR {var_pct:.2}% within {:.2}%", self.max_var_pct))
        };

        Ok(result
            .with_detail("var_pct", var_pct)
            .with_detail("var_amount", total_var)
            .with_detail("z", z))
    }
}

#[async_trait::async_trait]
impl RiskGate for ValueAtRiskGate {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn error_policy(&self) -> ErrorPolicy {
        ErrorPolicy::FailOpen
    }

    fn requires_market_data(&self) -> bool {
        true
    }

    async fn check(
        &mut self,
        portfolio: &Portfolio,
        market_data: Option<&MarketData>,
    ) -> Result<GateResult, GateError> {
        let data = market_data.ok_or_else(|| GateError::InvalidInput("market data required".into()))?;
        self.evaluate(portfolio, data)
    }

    fn status(&self) -> serde_json::Value {
        serde_json::json!({
            "confidence": self.confidence,
            "max_var_pct": self.max_var_pct,
            "last_var_pct": self.last_var_pct,
            "per_position": self.last_per_position,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::fixtures::{portfolio, position};

    fn gate() -> ValueAtRiskGate {
        ValueAtRiskGate::new(&RiskConfig::default())
    }

    #[test]
    fn test_z_score_95() {
        let z = gate().z_score().unwrap();
        assert!((z - 1.645).abs() < 0.001, "z={z}");
    }

    #[test]
    fn test_short_history_uses_fallback_vol() {
        let g = gate();
        assert_eq!(g.daily_volatility(&[100.0, 101.0, 102.0]), FALLBACK_VOL);
        assert_eq!(g.daily_volatility(&[]), FALLBACK_VOL);
    }

    #[test]
    fn test_flat_prices_have_zero_vol() {
        let g = gate();
        let closes = vec![100.0; 30];
        assert!(g.daily_volatility(&closes).abs() < 1e-12);
    }

    #[test]
    fn test_fallback_vol_breaches_for_large_position() {
        let mut g = gate();
        // 1.645 * 0.05 * 4000 = 329 -> 3.29% of 10k
        let pf = portfolio(10_000.0, 6_000.0, 0.0, vec![position("NEW", 40.0, 100.0)]);
        let r = g.evaluate(&pf, &MarketData::default()).unwrap();
        assert_eq!(r.action, GateAction::Reduce);
        assert!(r.passed);
        let pct = r.details["var_pct"].as_f64().unwrap();
        assert!((pct - 3.29).abs() < 0.01, "pct={pct}");
    }

    #[test]
    fn test_low_vol_history_allows() {
        let mut g = gate();
        let closes: Vec<f64> = (0..25).map(|i| 100.0 + if i % 2 == 0 { 0.0 } else { 0.5 }).collect();
        let mut data = MarketData::default();
        data.price_history.insert("SPY".into(), closes);
        let pf = portfolio(10_000.0, 6_000.0, 0.0, vec![position("SPY", 40.0, 100.0)]);
        let r = g.evaluate(&pf, &data).unwrap();
        assert_eq!(r.action, GateAction::Allow);
    }

    #[tokio::test]
    async fn test_missing_market_data_is_error() {
        let mut g = gate();
        assert!(g.requires_market_data());
        assert!(g.check(&Portfolio::default(), None).await.is_err());
    }
}
